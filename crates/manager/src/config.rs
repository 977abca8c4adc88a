// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cyberrange_engine::cloud::OpenStackConfig;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub listen_addr: SocketAddr,
    pub repo_dir: PathBuf,
    /// In-memory storage is used when unset
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub worker_count: usize,
    pub cloud_op_timeout: Duration,
    pub max_update_retries: u32,
    /// How long finished job statuses stay queryable
    pub job_retention: Duration,
    pub openstack: OpenStackConfig,
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        let worker_count: usize = vars.parsed("WORKER_COUNT", 4)?;
        if worker_count == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_COUNT",
                value: "0".to_string(),
                reason: "at least one worker is needed".to_string(),
            });
        }
        Ok(Self {
            listen_addr: vars.parsed("LISTEN_ADDR", SocketAddr::from(([0u16; 8], 50051)))?,
            repo_dir: PathBuf::from(
                vars.optional("REPO_DIR")
                    .unwrap_or_else(|| "/data/repo".to_string()),
            ),
            database_url: vars.optional("DATABASE_URL"),
            db_pool_size: vars.parsed("DATABASE_POOL_SIZE", 10)?,
            worker_count,
            cloud_op_timeout: Duration::from_secs(vars.parsed("CLOUD_OP_TIMEOUT_SECS", 120)?),
            max_update_retries: vars.parsed("MAX_UPDATE_RETRIES", 8)?,
            job_retention: Duration::from_secs(vars.parsed("JOB_RETENTION_SECS", 3600)?),
            openstack: OpenStackConfig {
                auth_url: vars.required("OS_AUTH_URL")?,
                username: vars.required("OS_USERNAME")?,
                password: vars.required("OS_PASSWORD")?,
                project_id: vars.required("OS_PROJECT_ID")?,
                user_domain_name: vars
                    .optional("OS_USER_DOMAIN_NAME")
                    .unwrap_or_else(|| "Default".to_string()),
                network_endpoint: vars.required("OS_NETWORK_ENDPOINT")?,
                compute_endpoint: vars.required("OS_COMPUTE_ENDPOINT")?,
                public_network_id: vars.required("OS_PUBLIC_NETWORK_ID")?,
            },
        })
    }
}
