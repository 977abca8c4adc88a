// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cloner::{InfraResource, ProvisioningFailure, ResourceKind};
use crate::error::{EngineError, ValidationError};
use crate::store::Store;

/// A scenario instance currently deployed for one or more team groups.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActiveScenarioRun {
    pub run_id: Uuid,
    pub scenario_id: String,
    pub started_by: String,
    pub start_time: DateTime<Utc>,
    /// Set once teardown begins
    pub end_time: Option<DateTime<Utc>>,
    pub team_groups: Vec<String>,
    pub resources: Vec<InfraResource>,
    /// user id -> participant id
    pub participants: BTreeMap<String, Uuid>,
    #[serde(default)]
    pub provisioning_failures: Vec<ProvisioningFailure>,
}

impl ActiveScenarioRun {
    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = &InfraResource> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Provisioning,
    Active,
    Ending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub scenario_id: String,
    pub started_by: String,
    pub state: RunState,
}

/// Tracks which scenarios are running and guards their lifecycle.
///
/// Each owner may run a scenario once at a time; different owners can run
/// the same scenario side by side. A run is reserved before provisioning
/// starts, so a second start by the same owner is rejected even while the
/// first is still creating resources. Run records themselves live in the
/// [`Store`].
pub struct Registry {
    store: Arc<dyn Store>,
    runs: Mutex<HashMap<Uuid, RunSummary>>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunSummary>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuilds the index from stored runs after a restart. Runs that were
    /// being torn down come back as active so they can be ended again.
    pub async fn restore(&self) -> Result<usize, EngineError> {
        let stored = self.store.list_runs().await?;
        let mut runs = self.runs();
        for run in &stored {
            runs.insert(
                run.run_id,
                RunSummary {
                    run_id: run.run_id,
                    scenario_id: run.scenario_id.clone(),
                    started_by: run.started_by.clone(),
                    state: RunState::Active,
                },
            );
        }
        Ok(stored.len())
    }

    /// Claims the scenario for a new run of this owner.
    pub fn reserve(&self, scenario_id: &str, started_by: &str) -> Result<Uuid, ValidationError> {
        let mut runs = self.runs();
        if let Some(existing) = runs
            .values()
            .find(|r| r.scenario_id == scenario_id && r.started_by == started_by)
        {
            return Err(ValidationError::AlreadyRunning {
                scenario_id: scenario_id.to_string(),
                owner: existing.started_by.clone(),
            });
        }
        let run_id = Uuid::now_v7();
        runs.insert(
            run_id,
            RunSummary {
                run_id,
                scenario_id: scenario_id.to_string(),
                started_by: started_by.to_string(),
                state: RunState::Provisioning,
            },
        );
        Ok(run_id)
    }

    /// Drops a reservation whose provisioning never produced a run.
    pub fn release(&self, run_id: Uuid) {
        self.runs().remove(&run_id);
    }

    /// Persists a provisioned run and marks it active.
    pub async fn activate(&self, run: &ActiveScenarioRun) -> Result<(), EngineError> {
        self.store.insert_run(run).await?;
        if let Some(entry) = self.runs().get_mut(&run.run_id) {
            entry.state = RunState::Active;
        }
        Ok(())
    }

    /// Moves an active run into teardown; only one caller can win this.
    pub fn begin_ending(&self, run_id: Uuid) -> Result<(), ValidationError> {
        let mut runs = self.runs();
        let Some(entry) = runs.get_mut(&run_id) else {
            return Err(ValidationError::UnknownRun(run_id));
        };
        match entry.state {
            RunState::Provisioning => Err(ValidationError::StillProvisioning(run_id)),
            RunState::Ending => Err(ValidationError::AlreadyEnding(run_id)),
            RunState::Active => {
                entry.state = RunState::Ending;
                Ok(())
            }
        }
    }

    /// Returns a run to the active state after a teardown that could not finish.
    pub fn abort_ending(&self, run_id: Uuid) {
        if let Some(entry) = self.runs().get_mut(&run_id) {
            entry.state = RunState::Active;
        }
    }

    pub fn state(&self, run_id: Uuid) -> Option<RunState> {
        self.runs().get(&run_id).map(|r| r.state)
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        let mut summaries: Vec<RunSummary> = self.runs().values().cloned().collect();
        summaries.sort_by_key(|r| r.run_id);
        summaries
    }

    pub async fn get(&self, run_id: Uuid) -> Result<ActiveScenarioRun, EngineError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownRun(run_id).into())
    }

    /// Removes the run record and frees the scenario for its owner.
    pub async fn remove(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.store.delete_run(run_id).await?;
        self.release(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn run(run_id: Uuid, scenario_id: &str) -> ActiveScenarioRun {
        ActiveScenarioRun {
            run_id,
            scenario_id: scenario_id.to_string(),
            started_by: "admin".to_string(),
            start_time: Utc::now(),
            end_time: None,
            team_groups: vec!["Team A".to_string()],
            resources: vec![],
            participants: BTreeMap::new(),
            provisioning_failures: vec![],
        }
    }

    #[tokio::test]
    async fn test_single_run_per_scenario_and_owner() {
        let registry = Registry::new(Arc::new(MemoryStore::new()));
        let run_id = registry.reserve("web-breach", "admin").unwrap();
        assert_eq!(registry.state(run_id), Some(RunState::Provisioning));

        match registry.reserve("web-breach", "admin") {
            Err(ValidationError::AlreadyRunning { owner, .. }) => assert_eq!(owner, "admin"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.reserve("other-scenario", "admin").is_ok());

        let other = registry.reserve("web-breach", "someone-else").unwrap();
        assert_ne!(other, run_id);
        assert!(registry.reserve("web-breach", "someone-else").is_err());
        assert_eq!(registry.summaries().len(), 3);

        registry.release(run_id);
        assert_eq!(registry.state(other), Some(RunState::Provisioning));
        assert!(registry.reserve("web-breach", "admin").is_ok());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let registry = Registry::new(Arc::new(MemoryStore::new()));
        let run_id = registry.reserve("web-breach", "admin").unwrap();
        assert_eq!(
            registry.begin_ending(run_id),
            Err(ValidationError::StillProvisioning(run_id))
        );

        registry.activate(&run(run_id, "web-breach")).await.unwrap();
        assert_eq!(registry.state(run_id), Some(RunState::Active));
        assert_eq!(registry.get(run_id).await.unwrap().scenario_id, "web-breach");

        registry.begin_ending(run_id).unwrap();
        assert_eq!(
            registry.begin_ending(run_id),
            Err(ValidationError::AlreadyEnding(run_id))
        );

        registry.remove(run_id).await.unwrap();
        assert_eq!(registry.state(run_id), None);
        assert!(matches!(
            registry.get(run_id).await,
            Err(EngineError::Validation(ValidationError::UnknownRun(_)))
        ));
        assert_eq!(
            registry.begin_ending(run_id),
            Err(ValidationError::UnknownRun(run_id))
        );
    }

    #[tokio::test]
    async fn test_restore() {
        let store = Arc::new(MemoryStore::new());
        let run_id = Uuid::now_v7();
        store.insert_run(&run(run_id, "web-breach")).await.unwrap();

        let registry = Registry::new(store);
        assert_eq!(registry.restore().await.unwrap(), 1);
        assert_eq!(registry.state(run_id), Some(RunState::Active));
        assert!(registry.reserve("web-breach", "admin").is_err());
        assert!(registry.reserve("web-breach", "someone-else").is_ok());
    }
}
