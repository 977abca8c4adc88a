// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Clones a scenario's logical topology once per team group.
//!
//! Groups are provisioned concurrently. Inside a group, networks come first,
//! then routers (which attach to those networks' subnets), then instances.
//! A resource that fails to provision is recorded and skipped; nothing that
//! was already created is rolled back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::assignment::{Assignee, TeamAssignment, team_slug};
use crate::cloud::{CloudAdapter, CloudError, CreatedNetwork, InstanceRequest, with_timeout};
use crate::template::{InfraTemplate, InstanceTemplate, RouterTemplate, TeamRole};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Router,
    Instance,
}

/// A concrete cloud resource created for one team group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InfraResource {
    pub team_group: String,
    pub logical_name: String,
    pub cloud_name: String,
    pub cloud_id: String,
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<TeamRole>,
    /// Networks only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    /// Routers only: subnets that were attached and must be detached on teardown
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attached_subnets: Vec<String>,
    /// Instances only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningFailure {
    pub team_group: String,
    pub logical_name: String,
    pub kind: ResourceKind,
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CloneReport {
    pub resources: Vec<InfraResource>,
    pub failures: Vec<ProvisioningFailure>,
}

impl CloneReport {
    pub fn instance(&self, team_group: &str, logical_name: &str) -> Option<&InfraResource> {
        self.resources.iter().find(|r| {
            r.kind == ResourceKind::Instance
                && r.team_group == team_group
                && r.logical_name == logical_name
        })
    }

    fn merge(&mut self, other: CloneReport) {
        self.resources.extend(other.resources);
        self.failures.extend(other.failures);
    }

    fn fail(
        &mut self,
        team_group: &str,
        logical_name: &str,
        kind: ResourceKind,
        error: impl ToString,
    ) {
        let error = error.to_string();
        tracing::warn!(
            "Failed to provision {:?} {} for {}: {}",
            kind,
            logical_name,
            team_group,
            error
        );
        self.failures.push(ProvisioningFailure {
            team_group: team_group.to_string(),
            logical_name: logical_name.to_string(),
            kind,
            error,
        });
    }
}

pub struct TeamEnvironmentCloner {
    cloud: Arc<dyn CloudAdapter>,
    op_timeout: Duration,
}

/// Per-group state while provisioning.
struct GroupRun<'a> {
    team_group: &'a str,
    slug: String,
    networks: HashMap<&'a str, CreatedNetwork>,
    report: CloneReport,
}

impl GroupRun<'_> {
    fn cloud_name(&self, logical_name: &str) -> String {
        format!("{}-{}", self.slug, logical_name)
    }
}

impl TeamEnvironmentCloner {
    pub fn new(cloud: Arc<dyn CloudAdapter>, op_timeout: Duration) -> Self {
        Self { cloud, op_timeout }
    }

    pub async fn clone_all(
        &self,
        infra: &InfraTemplate,
        assignment: &TeamAssignment,
        cancel: &CancellationToken,
    ) -> CloneReport {
        let groups = assignment
            .0
            .iter()
            .map(|(team_group, machines)| self.clone_group(infra, team_group, machines, cancel));
        let mut report = CloneReport::default();
        for group_report in futures_util::future::join_all(groups).await {
            report.merge(group_report);
        }
        report
    }

    async fn clone_group<'a>(
        &self,
        infra: &'a InfraTemplate,
        team_group: &'a str,
        machines: &BTreeMap<String, Assignee>,
        cancel: &CancellationToken,
    ) -> CloneReport {
        let mut group = GroupRun {
            team_group,
            slug: team_slug(team_group),
            networks: HashMap::new(),
            report: CloneReport::default(),
        };
        tracing::info!("Provisioning environment for {team_group}");

        for network in &infra.networks {
            if cancel.is_cancelled() {
                group.report.fail(team_group, &network.name, ResourceKind::Network, "cancelled");
                continue;
            }
            let cloud_name = group.cloud_name(&network.name);
            let subnet_name = format!("{cloud_name}-subnet");
            let created = with_timeout(
                "create_network",
                self.op_timeout,
                self.cloud
                    .create_network(&cloud_name, &subnet_name, &network.cidr),
            )
            .await;
            match created {
                Ok(created) => {
                    tracing::info!(
                        "Created network {cloud_name} ({}) for {team_group}",
                        created.network_id
                    );
                    group.report.resources.push(InfraResource {
                        team_group: team_group.to_string(),
                        logical_name: network.name.clone(),
                        cloud_name,
                        cloud_id: created.network_id.clone(),
                        kind: ResourceKind::Network,
                        role: None,
                        subnet_id: Some(created.subnet_id.clone()),
                        attached_subnets: vec![],
                        ip: None,
                    });
                    group.networks.insert(&network.name, created);
                }
                Err(e) => group
                    .report
                    .fail(team_group, &network.name, ResourceKind::Network, e),
            }
        }

        for router in &infra.routers {
            if cancel.is_cancelled() {
                group.report.fail(team_group, &router.name, ResourceKind::Router, "cancelled");
                continue;
            }
            self.clone_router(&mut group, router).await;
        }

        for instance in &infra.instances {
            if !machines.contains_key(&instance.name) {
                continue;
            }
            if cancel.is_cancelled() {
                group.report.fail(team_group, &instance.name, ResourceKind::Instance, "cancelled");
                continue;
            }
            self.clone_instance(&mut group, instance).await;
        }

        tracing::info!(
            "Provisioned {} resources for {team_group} ({} failures)",
            group.report.resources.len(),
            group.report.failures.len()
        );
        group.report
    }

    async fn clone_router(&self, group: &mut GroupRun<'_>, router: &RouterTemplate) {
        let team_group = group.team_group;
        let cloud_name = group.cloud_name(&router.name);
        let router_id = match with_timeout(
            "create_router",
            self.op_timeout,
            self.cloud.create_router(&cloud_name),
        )
        .await
        {
            Ok(id) => id,
            Err(e) => {
                group
                    .report
                    .fail(team_group, &router.name, ResourceKind::Router, e);
                return;
            }
        };
        tracing::info!("Created router {cloud_name} ({router_id}) for {team_group}");

        if router.external {
            if let Err(e) = with_timeout(
                "connect_router_public",
                self.op_timeout,
                self.cloud.connect_router_public(&router_id),
            )
            .await
            {
                group.report.fail(
                    team_group,
                    &router.name,
                    ResourceKind::Router,
                    format!("public gateway: {e}"),
                );
            }
        }

        let mut attached_subnets = vec![];
        for network_name in &router.subnets {
            let Some(network) = group.networks.get(network_name.as_str()) else {
                group.report.fail(
                    team_group,
                    &router.name,
                    ResourceKind::Router,
                    format!("network {network_name} was not provisioned"),
                );
                continue;
            };
            let subnet_id = network.subnet_id.clone();
            match with_timeout(
                "connect_router_private",
                self.op_timeout,
                self.cloud.connect_router_private(&router_id, &subnet_id),
            )
            .await
            {
                Ok(()) => attached_subnets.push(subnet_id),
                Err(e) => group.report.fail(
                    team_group,
                    &router.name,
                    ResourceKind::Router,
                    format!("attach {network_name}: {e}"),
                ),
            }
        }

        group.report.resources.push(InfraResource {
            team_group: team_group.to_string(),
            logical_name: router.name.clone(),
            cloud_name,
            cloud_id: router_id,
            kind: ResourceKind::Router,
            role: None,
            subnet_id: None,
            attached_subnets,
            ip: None,
        });
    }

    async fn clone_instance(&self, group: &mut GroupRun<'_>, instance: &InstanceTemplate) {
        let team_group = group.team_group;
        let network_ids: Result<Vec<String>, CloudError> = instance
            .networks
            .iter()
            .map(|name| {
                group
                    .networks
                    .get(name.as_str())
                    .map(|n| n.network_id.clone())
                    .ok_or_else(|| CloudError::Other(format!("network {name} was not provisioned")))
            })
            .collect();
        let network_ids = match network_ids {
            Ok(ids) => ids,
            Err(e) => {
                group
                    .report
                    .fail(team_group, &instance.name, ResourceKind::Instance, e);
                return;
            }
        };

        let request = InstanceRequest {
            name: group.cloud_name(&instance.name),
            image_id: instance.image_id.clone(),
            flavor_id: instance.flavor_id.clone(),
            network_ids,
        };
        match with_timeout(
            "create_instance",
            self.op_timeout,
            self.cloud.create_instance(&request),
        )
        .await
        {
            Ok(created) => {
                tracing::info!(
                    "Created instance {} ({}) for {team_group}",
                    request.name,
                    created.instance_id
                );
                group.report.resources.push(InfraResource {
                    team_group: team_group.to_string(),
                    logical_name: instance.name.clone(),
                    cloud_name: request.name,
                    cloud_id: created.instance_id,
                    kind: ResourceKind::Instance,
                    role: Some(instance.role),
                    subnet_id: None,
                    attached_subnets: vec![],
                    ip: created.ip,
                });
            }
            Err(e) => group
                .report
                .fail(team_group, &instance.name, ResourceKind::Instance, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::fixtures::{assign, two_teams};
    use crate::cloud::fake::{Call, FakeCloud};
    use crate::template::fixtures::range_template;
    use crate::template::NetworkTemplate;

    fn victim_only() -> InfraTemplate {
        InfraTemplate {
            networks: vec![NetworkTemplate {
                name: "lan".to_string(),
                cidr: "10.0.0.0/24".to_string(),
            }],
            routers: vec![],
            instances: vec![InstanceTemplate {
                name: "victim".to_string(),
                image_id: "ubuntu".to_string(),
                flavor_id: "m1.small".to_string(),
                networks: vec!["lan".to_string()],
                role: TeamRole::Blue,
            }],
        }
    }

    fn cloner(cloud: &Arc<FakeCloud>) -> TeamEnvironmentCloner {
        TeamEnvironmentCloner::new(cloud.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_one_instance_per_team_group() {
        let cloud = Arc::new(FakeCloud::new());
        let assignment = assign(&[
            ("Team A", &[("victim", "bob", TeamRole::Blue)]),
            ("Team B", &[("victim", "dave", TeamRole::Blue)]),
        ]);
        let report = cloner(&cloud)
            .clone_all(&victim_only(), &assignment, &CancellationToken::new())
            .await;
        assert!(report.failures.is_empty());

        let instances: Vec<(&str, &str)> = report
            .resources
            .iter()
            .filter(|r| r.kind == ResourceKind::Instance)
            .map(|r| (r.team_group.as_str(), r.cloud_name.as_str()))
            .collect();
        assert_eq!(
            instances,
            vec![("Team A", "team-a-victim"), ("Team B", "team-b-victim")]
        );
        let a = report.instance("Team A", "victim").unwrap();
        let b = report.instance("Team B", "victim").unwrap();
        assert_ne!(a.cloud_id, b.cloud_id);
        assert_eq!(a.role, Some(TeamRole::Blue));
    }

    #[tokio::test]
    async fn test_instances_use_their_groups_networks() {
        let cloud = Arc::new(FakeCloud::new());
        let report = cloner(&cloud)
            .clone_all(&range_template().infra, &two_teams(), &CancellationToken::new())
            .await;
        assert!(report.failures.is_empty());
        for group in ["Team A", "Team B"] {
            let group_networks: Vec<&str> = report
                .resources
                .iter()
                .filter(|r| r.kind == ResourceKind::Network && r.team_group == group)
                .map(|r| r.cloud_id.as_str())
                .collect();
            let victim = report.instance(group, "victim").unwrap();
            let used = cloud.instance_networks(&victim.cloud_id);
            assert_eq!(used.len(), 2);
            assert!(used.iter().all(|id| group_networks.contains(&id.as_str())));
        }
    }

    #[tokio::test]
    async fn test_dependency_order_within_group() {
        let cloud = Arc::new(FakeCloud::new());
        let assignment = assign(&[(
            "Team A",
            &[
                ("attacker", "alice", TeamRole::Red),
                ("victim", "bob", TeamRole::Blue),
            ],
        )]);
        let report = cloner(&cloud)
            .clone_all(&range_template().infra, &assignment, &CancellationToken::new())
            .await;
        assert!(report.failures.is_empty());

        let calls = cloud.calls();
        let position = |call: &Call| calls.iter().position(|c| c == call).unwrap();
        let router = position(&Call::CreateRouter("team-a-edge".to_string()));
        assert!(position(&Call::CreateNetwork("team-a-dmz".to_string())) < router);
        assert!(position(&Call::CreateNetwork("team-a-internal".to_string())) < router);
        assert!(router < position(&Call::CreateInstance("team-a-attacker".to_string())));
        assert!(calls.contains(&Call::ConnectPublic("team-a-edge".to_string())));

        let edge = report
            .resources
            .iter()
            .find(|r| r.kind == ResourceKind::Router)
            .unwrap();
        assert_eq!(edge.attached_subnets.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_network_skips_dependents_without_rollback() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_on("team-a-internal");
        let report = cloner(&cloud)
            .clone_all(&range_template().infra, &two_teams(), &CancellationToken::new())
            .await;

        // victim needs the internal network, attacker does not
        assert!(report.instance("Team A", "victim").is_none());
        assert!(report.instance("Team A", "attacker").is_some());
        assert!(report.instance("Team B", "victim").is_some());

        let failed: Vec<(&str, ResourceKind)> = report
            .failures
            .iter()
            .map(|f| (f.logical_name.as_str(), f.kind))
            .collect();
        assert!(failed.contains(&("internal", ResourceKind::Network)));
        assert!(failed.contains(&("edge", ResourceKind::Router)));
        assert!(failed.contains(&("victim", ResourceKind::Instance)));

        // Nothing was deleted
        assert!(
            !cloud
                .calls()
                .iter()
                .any(|c| matches!(c, Call::DeleteNetwork(_) | Call::DeleteInstance(_)))
        );
        assert!(cloud.alive_names().contains(&"team-a-dmz".to_string()));
    }

    #[tokio::test]
    async fn test_failed_instance_is_recorded() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_on("team-b-attacker");
        let report = cloner(&cloud)
            .clone_all(&range_template().infra, &two_teams(), &CancellationToken::new())
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].team_group, "Team B");
        assert_eq!(report.failures[0].kind, ResourceKind::Instance);
        assert!(report.instance("Team B", "victim").is_some());
    }

    #[tokio::test]
    async fn test_cloud_timeout_is_a_failure() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.set_delay(Duration::from_millis(200));
        let cloner = TeamEnvironmentCloner::new(cloud.clone(), Duration::from_millis(20));
        let assignment = assign(&[("Team A", &[("victim", "bob", TeamRole::Blue)])]);
        let report = cloner
            .clone_all(&victim_only(), &assignment, &CancellationToken::new())
            .await;
        assert!(report.resources.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cloud = Arc::new(FakeCloud::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = cloner(&cloud)
            .clone_all(&range_template().infra, &two_teams(), &cancel)
            .await;
        assert!(report.resources.is_empty());
        assert!(cloud.calls().is_empty());
    }
}
