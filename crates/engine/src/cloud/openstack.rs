// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::{CloudAdapter, CloudError, CreatedInstance, CreatedNetwork, InstanceRequest};

#[derive(Debug, Clone)]
pub struct OpenStackConfig {
    /// Keystone v3 endpoint, e.g. `https://keystone.example.org/v3`
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_id: String,
    pub user_domain_name: String,
    /// Neutron endpoint without the `/v2.0` suffix
    pub network_endpoint: String,
    /// Nova endpoint including the project path if the deployment needs it
    pub compute_endpoint: String,
    /// External network routers are attached to for public access
    pub public_network_id: String,
}

struct Token {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Talks to Keystone, Neutron and Nova over their REST APIs.
pub struct OpenStackAdapter {
    config: OpenStackConfig,
    http: reqwest::Client,
    token: Mutex<Option<Token>>,
}

const NOVA_MICROVERSION: &str = "2.6";

impl OpenStackAdapter {
    pub fn new(config: OpenStackConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    async fn token(&self) -> Result<String, CloudError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - Utc::now() > TimeDelta::minutes(1) {
                return Ok(token.value.clone());
            }
        }

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": { "name": self.config.user_domain_name },
                            "password": self.config.password,
                        }
                    }
                },
                "scope": { "project": { "id": self.config.project_id } }
            }
        });
        let response = self
            .http
            .post(format!(
                "{}/auth/tokens",
                self.config.auth_url.trim_end_matches('/')
            ))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CloudError::Auth(format!(
                "Keystone returned {}",
                response.status()
            )));
        }
        let value = response
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| CloudError::Auth("missing X-Subject-Token header".to_string()))?
            .to_string();
        let payload: Value = response.json().await?;
        let expires_at = payload["token"]["expires_at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + TimeDelta::hours(1));
        tracing::debug!("Obtained OpenStack token valid until {expires_at}");
        *cached = Some(Token {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }

    /// Sends an authenticated request. `Ok(None)` means the target no longer exists.
    async fn request(
        &self,
        operation: &'static str,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<Option<Value>, CloudError> {
        let token = self.token().await?;
        let mut request = self
            .http
            .request(method, &url)
            .header("X-Auth-Token", token)
            .header("X-OpenStack-Nova-API-Version", NOVA_MICROVERSION);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                operation,
                status: status.as_u16(),
                body,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Some(Value::Null));
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| CloudError::Malformed {
                operation,
                reason: e.to_string(),
            })
    }

    /// Like `request`, but a missing target is an error.
    async fn expect(
        &self,
        operation: &'static str,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<Value, CloudError> {
        self.request(operation, method, url.clone(), body)
            .await?
            .ok_or_else(|| CloudError::Api {
                operation,
                status: StatusCode::NOT_FOUND.as_u16(),
                body: url,
            })
    }

    fn neutron(&self, path: &str) -> String {
        format!(
            "{}/v2.0/{}",
            self.config.network_endpoint.trim_end_matches('/'),
            path
        )
    }

    fn nova(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.compute_endpoint.trim_end_matches('/'),
            path
        )
    }
}

fn string_field(
    operation: &'static str,
    value: &Value,
    pointer: &str,
) -> Result<String, CloudError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CloudError::Malformed {
            operation,
            reason: format!("missing {pointer}"),
        })
}

fn first_address(server: &Value) -> Option<String> {
    server
        .pointer("/server/addresses")?
        .as_object()?
        .values()
        .filter_map(Value::as_array)
        .flatten()
        .find_map(|addr| addr.get("addr").and_then(Value::as_str))
        .map(str::to_string)
}

/// Nova may briefly keep returning a server in `DELETED` state.
fn is_deleted(server: &Value) -> bool {
    server
        .pointer("/server/status")
        .and_then(Value::as_str)
        .is_some_and(|status| status.eq_ignore_ascii_case("deleted"))
}

#[async_trait::async_trait]
impl CloudAdapter for OpenStackAdapter {
    async fn create_network(
        &self,
        name: &str,
        subnet_name: &str,
        cidr: &str,
    ) -> Result<CreatedNetwork, CloudError> {
        let network = self
            .expect(
                "create_network",
                Method::POST,
                self.neutron("networks"),
                Some(json!({ "network": { "name": name, "admin_state_up": true } })),
            )
            .await?;
        let network_id = string_field("create_network", &network, "/network/id")?;
        let subnet = self
            .expect(
                "create_subnet",
                Method::POST,
                self.neutron("subnets"),
                Some(json!({
                    "subnet": {
                        "name": subnet_name,
                        "network_id": network_id,
                        "ip_version": 4,
                        "cidr": cidr,
                    }
                })),
            )
            .await;
        let subnet = match subnet {
            Ok(subnet) => subnet,
            Err(e) => {
                // A network without its subnet is useless to the caller
                if let Err(cleanup) = self.delete_network(&network_id).await {
                    tracing::warn!("Failed to remove network {network_id}: {cleanup}");
                }
                return Err(e);
            }
        };
        Ok(CreatedNetwork {
            network_id,
            subnet_id: string_field("create_subnet", &subnet, "/subnet/id")?,
        })
    }

    async fn create_router(&self, name: &str) -> Result<String, CloudError> {
        let router = self
            .expect(
                "create_router",
                Method::POST,
                self.neutron("routers"),
                Some(json!({ "router": { "name": name, "admin_state_up": true } })),
            )
            .await?;
        string_field("create_router", &router, "/router/id")
    }

    async fn connect_router_public(&self, router_id: &str) -> Result<(), CloudError> {
        self.expect(
            "connect_router_public",
            Method::PUT,
            self.neutron(&format!("routers/{router_id}")),
            Some(json!({
                "router": {
                    "external_gateway_info": { "network_id": self.config.public_network_id }
                }
            })),
        )
        .await?;
        Ok(())
    }

    async fn connect_router_private(
        &self,
        router_id: &str,
        subnet_id: &str,
    ) -> Result<(), CloudError> {
        self.expect(
            "connect_router_private",
            Method::PUT,
            self.neutron(&format!("routers/{router_id}/add_router_interface")),
            Some(json!({ "subnet_id": subnet_id })),
        )
        .await?;
        Ok(())
    }

    async fn disconnect_router_private(
        &self,
        router_id: &str,
        subnet_id: &str,
    ) -> Result<(), CloudError> {
        self.request(
            "disconnect_router_private",
            Method::PUT,
            self.neutron(&format!("routers/{router_id}/remove_router_interface")),
            Some(json!({ "subnet_id": subnet_id })),
        )
        .await?;
        Ok(())
    }

    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<CreatedInstance, CloudError> {
        let networks: Vec<Value> = request
            .network_ids
            .iter()
            .map(|id| json!({ "uuid": id }))
            .collect();
        let server = self
            .expect(
                "create_instance",
                Method::POST,
                self.nova("servers"),
                Some(json!({
                    "server": {
                        "name": request.name,
                        "imageRef": request.image_id,
                        "flavorRef": request.flavor_id,
                        "networks": networks,
                    }
                })),
            )
            .await?;
        let instance_id = string_field("create_instance", &server, "/server/id")?;
        // Addresses are usually only known once the port is bound, so this may be empty
        let ip = match self
            .request(
                "get_instance",
                Method::GET,
                self.nova(&format!("servers/{instance_id}")),
                None,
            )
            .await
        {
            Ok(Some(details)) => first_address(&details),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("Could not read addresses of {instance_id}: {e}");
                None
            }
        };
        Ok(CreatedInstance { instance_id, ip })
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.request(
            "delete_instance",
            Method::DELETE,
            self.nova(&format!("servers/{instance_id}")),
            None,
        )
        .await?;
        Ok(())
    }

    async fn instance_exists(&self, instance_id: &str) -> Result<bool, CloudError> {
        let server = self
            .request(
                "get_instance",
                Method::GET,
                self.nova(&format!("servers/{instance_id}")),
                None,
            )
            .await?;
        Ok(server.is_some_and(|server| !is_deleted(&server)))
    }

    async fn delete_router(&self, router_id: &str) -> Result<(), CloudError> {
        self.request(
            "delete_router",
            Method::DELETE,
            self.neutron(&format!("routers/{router_id}")),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete_network(&self, network_id: &str) -> Result<(), CloudError> {
        self.request(
            "delete_network",
            Method::DELETE,
            self.neutron(&format!("networks/{network_id}")),
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_console(&self, instance_id: &str) -> Result<String, CloudError> {
        let console = self
            .expect(
                "get_console",
                Method::POST,
                self.nova(&format!("servers/{instance_id}/remote-consoles")),
                Some(json!({ "remote_console": { "protocol": "vnc", "type": "novnc" } })),
            )
            .await?;
        string_field("get_console", &console, "/remote_console/url")
    }
}
