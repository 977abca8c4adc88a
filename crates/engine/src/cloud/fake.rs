// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{CloudAdapter, CloudError, CreatedInstance, CreatedNetwork, InstanceRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateNetwork(String),
    CreateRouter(String),
    ConnectPublic(String),
    ConnectPrivate(String, String),
    DisconnectPrivate(String, String),
    CreateInstance(String),
    DeleteInstance(String),
    DeleteRouter(String),
    DeleteNetwork(String),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    next_id: u64,
    /// Cloud id -> name of everything currently alive
    alive: HashMap<String, String>,
    instance_networks: HashMap<String, Vec<String>>,
    /// Deleted instances whose ports are still bound, until the deadline
    terminating: HashMap<String, Instant>,
}

impl State {
    /// Instances still holding a port on the network.
    fn ports_on(&mut self, network_id: &str) -> usize {
        let now = Instant::now();
        self.terminating.retain(|_, until| *until > now);
        self.instance_networks
            .iter()
            .filter(|(id, networks)| {
                (self.alive.contains_key(*id) || self.terminating.contains_key(*id))
                    && networks.iter().any(|n| n == network_id)
            })
            .count()
    }
}

/// In-process cloud that records every call and fails on request.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<State>,
    fail_names: Mutex<HashSet<String>>,
    fail_deletes: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    linger: Mutex<Option<Duration>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any create call for a resource with this cloud name fails.
    pub fn fail_on(&self, name: &str) {
        self.fail_names.lock().unwrap().insert(name.to_string());
    }

    /// Deleting the resource with this cloud name fails.
    pub fn fail_delete_of(&self, name: &str) {
        self.fail_deletes.lock().unwrap().insert(name.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Deleted instances keep their ports for this long, like Nova does.
    pub fn set_instance_linger(&self, linger: Duration) {
        *self.linger.lock().unwrap() = Some(linger);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn alive_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().alive.values().cloned().collect();
        names.sort();
        names
    }

    pub fn instance_networks(&self, instance_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .instance_networks
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn create(&self, call: Call, name: &str, prefix: &str) -> Result<String, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if self.fail_names.lock().unwrap().contains(name) {
            return Err(CloudError::Other(format!("injected failure for {name}")));
        }
        state.next_id += 1;
        let id = format!("{prefix}-{}", state.next_id);
        state.alive.insert(id.clone(), name.to_string());
        Ok(id)
    }

    fn delete(&self, call: Call, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if let Some(name) = state.alive.get(id) {
            if self.fail_deletes.lock().unwrap().contains(name) {
                return Err(CloudError::Other(format!("injected delete failure for {name}")));
            }
        }
        state.alive.remove(id);
        Ok(())
    }

    fn name_of(&self, id: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .alive
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

#[async_trait::async_trait]
impl CloudAdapter for FakeCloud {
    async fn create_network(
        &self,
        name: &str,
        subnet_name: &str,
        _cidr: &str,
    ) -> Result<CreatedNetwork, CloudError> {
        self.pause().await;
        let network_id = self.create(Call::CreateNetwork(name.to_string()), name, "net")?;
        let subnet_id = format!("{network_id}-{subnet_name}");
        Ok(CreatedNetwork {
            network_id,
            subnet_id,
        })
    }

    async fn create_router(&self, name: &str) -> Result<String, CloudError> {
        self.pause().await;
        self.create(Call::CreateRouter(name.to_string()), name, "router")
    }

    async fn connect_router_public(&self, router_id: &str) -> Result<(), CloudError> {
        let name = self.name_of(router_id);
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::ConnectPublic(name));
        Ok(())
    }

    async fn connect_router_private(
        &self,
        router_id: &str,
        subnet_id: &str,
    ) -> Result<(), CloudError> {
        let name = self.name_of(router_id);
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::ConnectPrivate(name, subnet_id.to_string()));
        Ok(())
    }

    async fn disconnect_router_private(
        &self,
        router_id: &str,
        subnet_id: &str,
    ) -> Result<(), CloudError> {
        let name = self.name_of(router_id);
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::DisconnectPrivate(name, subnet_id.to_string()));
        Ok(())
    }

    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<CreatedInstance, CloudError> {
        self.pause().await;
        let instance_id = self.create(
            Call::CreateInstance(request.name.clone()),
            &request.name,
            "vm",
        )?;
        self.state
            .lock()
            .unwrap()
            .instance_networks
            .insert(instance_id.clone(), request.network_ids.clone());
        Ok(CreatedInstance {
            instance_id,
            ip: Some("10.0.0.10".to_string()),
        })
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        let name = self.name_of(instance_id);
        self.delete(Call::DeleteInstance(name), instance_id)?;
        let linger = *self.linger.lock().unwrap();
        if let Some(linger) = linger {
            self.state
                .lock()
                .unwrap()
                .terminating
                .insert(instance_id.to_string(), Instant::now() + linger);
        }
        Ok(())
    }

    async fn instance_exists(&self, instance_id: &str) -> Result<bool, CloudError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.terminating.retain(|_, until| *until > now);
        Ok(state.alive.contains_key(instance_id) || state.terminating.contains_key(instance_id))
    }

    async fn delete_router(&self, router_id: &str) -> Result<(), CloudError> {
        let name = self.name_of(router_id);
        self.delete(Call::DeleteRouter(name), router_id)
    }

    async fn delete_network(&self, network_id: &str) -> Result<(), CloudError> {
        let name = self.name_of(network_id);
        let ports = self.state.lock().unwrap().ports_on(network_id);
        if ports > 0 {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(Call::DeleteNetwork(name.clone()));
            return Err(CloudError::Api {
                operation: "delete_network",
                status: 409,
                body: format!("{ports} ports in use on {name}"),
            });
        }
        self.delete(Call::DeleteNetwork(name), network_id)
    }

    async fn get_console(&self, instance_id: &str) -> Result<String, CloudError> {
        Ok(format!("https://console.example.org/{instance_id}"))
    }
}
