// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::cloner::{InfraResource, ResourceKind};
use crate::cloud::{CloudAdapter, CloudError, with_timeout};
use crate::error::EngineError;
use crate::registry::{ActiveScenarioRun, Registry};
use crate::store::Store;

const MAX_POLL_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TeardownReport {
    pub scenario_id: String,
    pub deleted_resources: usize,
    /// Cloud deletions that failed; the resources may have leaked
    pub cleanup_failures: Vec<String>,
    pub archived_participants: usize,
}

/// Deprovisions a run and moves it and its participants into the archive.
///
/// Cloud deletions are best effort. A resource that cannot be deleted is
/// logged and reported, and archival continues regardless.
pub struct Teardown {
    cloud: Arc<dyn CloudAdapter>,
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    op_timeout: Duration,
}

impl Teardown {
    pub fn new(
        cloud: Arc<dyn CloudAdapter>,
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            cloud,
            store,
            registry,
            clock,
            op_timeout,
        }
    }

    /// Ends the run. Returns `None` when there is no active run with this id,
    /// which is the case after a previous teardown finished.
    ///
    /// Cancellation is honored between deletion phases. The run then stays
    /// active with only the resources that still exist, and ending it again
    /// picks up where this attempt stopped.
    pub async fn end_run(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<TeardownReport>, EngineError> {
        let Some(mut run) = self.store.get_run(run_id).await? else {
            tracing::info!("Run {run_id} is not active, nothing to tear down");
            return Ok(None);
        };
        tracing::info!("Tearing down run {run_id} of {}", run.scenario_id);

        run.end_time = Some(self.clock.now());
        self.store.update_run(&run).await?;
        self.store.archive_run(&run).await?;

        let mut report = TeardownReport {
            scenario_id: run.scenario_id.clone(),
            ..Default::default()
        };
        if let Err(remaining) = self.delete_resources(&run, &mut report, cancel).await {
            tracing::warn!(
                "Teardown of run {run_id} interrupted with {} resources left",
                remaining.len()
            );
            run.end_time = None;
            run.resources = remaining;
            self.store.update_run(&run).await?;
            return Err(EngineError::Interrupted(run_id));
        }

        for participant in self.store.list_participants(run_id).await? {
            self.store.archive_participant(&participant).await?;
            self.store
                .delete_participant(participant.participant_id)
                .await?;
            report.archived_participants += 1;
        }

        self.registry.remove(run_id).await?;
        tracing::info!(
            "Run {run_id} archived: {} resources deleted, {} failures, {} participants",
            report.deleted_resources,
            report.cleanup_failures.len(),
            report.archived_participants
        );
        Ok(Some(report))
    }

    /// Instances first, then routers, then networks. Networks are only
    /// deleted once the instances attached to them are gone.
    ///
    /// On cancellation, returns the resources that were not deleted.
    async fn delete_resources(
        &self,
        run: &ActiveScenarioRun,
        report: &mut TeardownReport,
        cancel: &CancellationToken,
    ) -> Result<(), Vec<InfraResource>> {
        let mut deleted: HashSet<&str> = HashSet::new();
        let remaining = |deleted: &HashSet<&str>| -> Vec<InfraResource> {
            run.resources
                .iter()
                .filter(|r| !deleted.contains(r.cloud_id.as_str()))
                .cloned()
                .collect()
        };

        if cancel.is_cancelled() {
            return Err(remaining(&deleted));
        }
        for instance in run.resources_of(ResourceKind::Instance) {
            let result = with_timeout(
                "delete_instance",
                self.op_timeout,
                self.cloud.delete_instance(&instance.cloud_id),
            )
            .await;
            if record(report, instance, result) {
                deleted.insert(instance.cloud_id.as_str());
            }
        }
        let terminating: Vec<&str> = run
            .resources_of(ResourceKind::Instance)
            .map(|i| i.cloud_id.as_str())
            .filter(|id| deleted.contains(id))
            .collect();
        if !self.wait_for_instances(terminating, cancel).await {
            return Err(remaining(&deleted));
        }

        if cancel.is_cancelled() {
            return Err(remaining(&deleted));
        }
        for router in run.resources_of(ResourceKind::Router) {
            for subnet_id in &router.attached_subnets {
                if let Err(e) = with_timeout(
                    "disconnect_router_private",
                    self.op_timeout,
                    self.cloud.disconnect_router_private(&router.cloud_id, subnet_id),
                )
                .await
                {
                    tracing::warn!(
                        "Failed to detach subnet {subnet_id} from router {}: {e}",
                        router.cloud_name
                    );
                }
            }
            let result = with_timeout(
                "delete_router",
                self.op_timeout,
                self.cloud.delete_router(&router.cloud_id),
            )
            .await;
            if record(report, router, result) {
                deleted.insert(router.cloud_id.as_str());
            }
        }

        if cancel.is_cancelled() {
            return Err(remaining(&deleted));
        }
        for network in run.resources_of(ResourceKind::Network) {
            let result = with_timeout(
                "delete_network",
                self.op_timeout,
                self.cloud.delete_network(&network.cloud_id),
            )
            .await;
            if record(report, network, result) {
                deleted.insert(network.cloud_id.as_str());
            }
        }
        Ok(())
    }

    /// Polls until the instances no longer exist, for at most the operation
    /// timeout. Returns false if cancelled while waiting.
    async fn wait_for_instances(
        &self,
        mut pending: Vec<&str>,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + self.op_timeout;
        let mut delay = Duration::from_millis(100);
        loop {
            let mut still_there = vec![];
            for instance_id in pending {
                match with_timeout(
                    "instance_exists",
                    self.op_timeout,
                    self.cloud.instance_exists(instance_id),
                )
                .await
                {
                    Ok(false) => {}
                    Ok(true) => still_there.push(instance_id),
                    Err(e) => {
                        tracing::debug!("Failed to look up instance {instance_id}: {e}");
                        still_there.push(instance_id);
                    }
                }
            }
            pending = still_there;
            if pending.is_empty() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    "{} instances still deleting after {:?}, removing networks anyway",
                    pending.len(),
                    self.op_timeout
                );
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay.min(deadline - now)) => {}
            }
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
    }
}

/// Returns whether the resource was deleted.
fn record(
    report: &mut TeardownReport,
    resource: &InfraResource,
    result: Result<(), CloudError>,
) -> bool {
    match result {
        Ok(()) => {
            tracing::info!(
                "Deleted {:?} {} of {}",
                resource.kind,
                resource.cloud_name,
                resource.team_group
            );
            report.deleted_resources += 1;
            true
        }
        Err(e) => {
            tracing::warn!(
                "Failed to delete {:?} {} of {}: {e}",
                resource.kind,
                resource.cloud_name,
                resource.team_group
            );
            report
                .cleanup_failures
                .push(format!("{}: {e}", resource.cloud_name));
            false
        }
    }
}
