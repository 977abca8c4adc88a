// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use thiserror::Error;

#[cfg(test)]
pub(crate) mod fake;
mod openstack;

pub use openstack::{OpenStackAdapter, OpenStackConfig};

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{operation} failed with status {status}: {body}")]
    Api {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("Unexpected response to {operation}: {reason}")]
    Malformed {
        operation: &'static str,
        reason: String,
    },
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNetwork {
    pub network_id: String,
    pub subnet_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub network_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub instance_id: String,
    pub ip: Option<String>,
}

/// Operations the engine needs from the cloud backend.
///
/// Implementations are shared between concurrently running provisioning jobs.
#[async_trait::async_trait]
pub trait CloudAdapter: Send + Sync {
    async fn create_network(
        &self,
        name: &str,
        subnet_name: &str,
        cidr: &str,
    ) -> Result<CreatedNetwork, CloudError>;

    async fn create_router(&self, name: &str) -> Result<String, CloudError>;

    async fn connect_router_public(&self, router_id: &str) -> Result<(), CloudError>;

    async fn connect_router_private(&self, router_id: &str, subnet_id: &str)
    -> Result<(), CloudError>;

    async fn disconnect_router_private(
        &self,
        router_id: &str,
        subnet_id: &str,
    ) -> Result<(), CloudError>;

    async fn create_instance(&self, request: &InstanceRequest)
    -> Result<CreatedInstance, CloudError>;

    /// Deletion is asynchronous on most clouds; the instance keeps its ports
    /// until it is gone.
    async fn delete_instance(&self, instance_id: &str) -> Result<(), CloudError>;

    /// False once the instance is fully deleted.
    async fn instance_exists(&self, instance_id: &str) -> Result<bool, CloudError>;

    async fn delete_router(&self, router_id: &str) -> Result<(), CloudError>;

    async fn delete_network(&self, network_id: &str) -> Result<(), CloudError>;

    async fn get_console(&self, instance_id: &str) -> Result<String, CloudError>;
}

/// Runs a cloud call under the configured operation timeout.
pub(crate) async fn with_timeout<T>(
    operation: &'static str,
    timeout: Duration,
    call: impl Future<Output = Result<T, CloudError>>,
) -> Result<T, CloudError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CloudError::Timeout { operation, timeout }),
    }
}
