// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admin::LockTarget;
use crate::assignment::TeamAssignment;
use crate::clock::{Clock, SystemClock};
use crate::cloner::TeamEnvironmentCloner;
use crate::cloud::{CloudAdapter, with_timeout};
use crate::error::{EngineError, ValidationError};
use crate::events::{EventBus, ScenarioEvent};
use crate::jobs::{
    Job, JobHandler, JobId, JobStatus, ProvisionRequest, TeardownRequest, WorkerPool,
};
use crate::progress::{
    FlagSubmission, HintView, LockChange, MilestoneReview, MilestoneSubmission,
    ParticipantProgress, ParticipantStateManager,
};
use crate::registry::{ActiveScenarioRun, Registry, RunState, RunSummary};
use crate::store::{MemoryStore, Store};
use crate::teardown::Teardown;
use crate::template::{TemplateError, TemplateStore};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StartedScenario {
    pub run_id: Uuid,
    pub job_id: JobId,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EndedScenario {
    Queued { job_id: JobId },
    /// The run was already torn down and archived
    AlreadyEnded,
}

/// Everything a moderator sees about one run.
#[derive(Serialize, Debug, Clone)]
pub struct ModeratorView {
    pub run: ActiveScenarioRun,
    /// None once the run is archived
    pub state: Option<RunState>,
    pub participants: Vec<ParticipantProgress>,
}

/// The parts shared between request handling and background jobs.
struct Core {
    templates: Arc<dyn TemplateStore>,
    cloud: Arc<dyn CloudAdapter>,
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    participants: ParticipantStateManager,
    cloner: TeamEnvironmentCloner,
    teardown: Teardown,
    events: EventBus,
    clock: Arc<dyn Clock>,
    op_timeout: Duration,
}

impl Core {
    async fn provision(
        &self,
        request: ProvisionRequest,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let run_id = request.run_id;
        match self.try_provision(&request, &cancel).await {
            Ok(run) => {
                self.events.publish(ScenarioEvent::ScenarioStarted {
                    run_id,
                    scenario_id: run.scenario_id.clone(),
                    resources: run.resources.len(),
                    failures: run.provisioning_failures.len(),
                });
                Ok(())
            }
            Err(e) => {
                self.registry.release(run_id);
                self.participants.forget_run(run_id);
                self.events.publish(ScenarioEvent::ProvisioningFailed {
                    run_id,
                    scenario_id: request.scenario_id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn try_provision(
        &self,
        request: &ProvisionRequest,
        cancel: &CancellationToken,
    ) -> Result<ActiveScenarioRun, EngineError> {
        let template = &request.template;
        let report = self
            .cloner
            .clone_all(&template.infra, &request.assignment, cancel)
            .await;
        if cancel.is_cancelled() {
            tracing::warn!(
                "Provisioning of run {} was cancelled, keeping what was created",
                request.run_id
            );
        }

        let mut participants = BTreeMap::new();
        for seat in request.assignment.seats() {
            let instance_id = report
                .instance(seat.team_group, seat.machine)
                .map(|r| r.cloud_id.clone());
            let participant = self
                .participants
                .init_participant(request.run_id, template, &seat, instance_id)
                .await?;
            participants.insert(seat.assignee.user_id.clone(), participant.participant_id);
        }

        let run = ActiveScenarioRun {
            run_id: request.run_id,
            scenario_id: request.scenario_id.clone(),
            started_by: request.started_by.clone(),
            start_time: self.clock.now(),
            end_time: None,
            team_groups: request.assignment.team_groups(),
            resources: report.resources,
            participants,
            provisioning_failures: report.failures,
        };
        self.registry.activate(&run).await?;
        tracing::info!(
            "Run {} of {} is active with {} resources and {} provisioning failures",
            run.run_id,
            run.scenario_id,
            run.resources.len(),
            run.provisioning_failures.len()
        );
        Ok(run)
    }

    async fn tear_down(
        &self,
        request: TeardownRequest,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let run_id = request.run_id;
        match self.teardown.end_run(run_id, &cancel).await {
            Ok(Some(report)) => {
                self.participants.forget_run(run_id);
                self.events.publish(ScenarioEvent::ScenarioEnded {
                    run_id,
                    scenario_id: report.scenario_id,
                    cleanup_failures: report.cleanup_failures.len(),
                });
                Ok(())
            }
            Ok(None) => {
                self.registry.release(run_id);
                self.participants.forget_run(run_id);
                Ok(())
            }
            Err(e) => {
                self.registry.abort_ending(run_id);
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for Core {
    async fn handle(&self, job: Job, cancel: CancellationToken) -> Result<(), EngineError> {
        match job {
            Job::Provision(request) => self.provision(request, cancel).await,
            Job::Teardown(request) => self.tear_down(request, cancel).await,
        }
    }

    fn abandon(&self, job: Job) {
        match job {
            Job::Provision(request) => self.registry.release(request.run_id),
            Job::Teardown(request) => self.registry.abort_ending(request.run_id),
        }
    }
}

pub struct OrchestratorBuilder {
    templates: Arc<dyn TemplateStore>,
    cloud: Arc<dyn CloudAdapter>,
    store: Option<Arc<dyn Store>>,
    clock: Option<Arc<dyn Clock>>,
    workers: usize,
    queue_capacity: usize,
    job_retention: Duration,
    op_timeout: Duration,
    max_update_retries: u32,
}

impl OrchestratorBuilder {
    pub fn new(templates: Arc<dyn TemplateStore>, cloud: Arc<dyn CloudAdapter>) -> Self {
        Self {
            templates,
            cloud,
            store: None,
            clock: None,
            workers: 4,
            queue_capacity: 64,
            job_retention: Duration::from_secs(3600),
            op_timeout: Duration::from_secs(120),
            max_update_retries: 8,
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// How long statuses of finished jobs stay queryable.
    pub fn job_retention(mut self, job_retention: Duration) -> Self {
        self.job_retention = job_retention;
        self
    }

    pub fn op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn max_update_retries(mut self, max_update_retries: u32) -> Self {
        self.max_update_retries = max_update_retries;
        self
    }

    /// Restores active runs from the store and starts the job workers.
    pub async fn build(self) -> Result<Orchestrator, EngineError> {
        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => {
                tracing::warn!("No store configured, run state will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let registry = Arc::new(Registry::new(store.clone()));
        let restored = registry.restore().await?;
        if restored > 0 {
            tracing::info!("Restored {restored} active runs");
        }

        let core = Arc::new(Core {
            templates: self.templates.clone(),
            cloud: self.cloud.clone(),
            store: store.clone(),
            registry: registry.clone(),
            participants: ParticipantStateManager::new(
                store.clone(),
                self.templates,
                clock.clone(),
                self.max_update_retries,
            ),
            cloner: TeamEnvironmentCloner::new(self.cloud.clone(), self.op_timeout),
            teardown: Teardown::new(
                self.cloud,
                store,
                registry,
                clock.clone(),
                self.op_timeout,
            ),
            events: EventBus::default(),
            clock,
            op_timeout: self.op_timeout,
        });
        let pool = WorkerPool::start(
            core.clone(),
            self.workers,
            self.queue_capacity,
            self.job_retention,
        );
        Ok(Orchestrator { core, pool })
    }
}

/// Entry point for every scenario operation.
pub struct Orchestrator {
    core: Arc<Core>,
    pool: WorkerPool,
}

impl Orchestrator {
    pub fn subscribe(&self) -> broadcast::Receiver<ScenarioEvent> {
        self.core.events.subscribe()
    }

    /// Validates the request and queues provisioning. The scenario counts as
    /// running from here on.
    pub async fn start_scenario(
        &self,
        scenario_id: &str,
        started_by: &str,
        assignment: TeamAssignment,
    ) -> Result<StartedScenario, EngineError> {
        let template = match self.core.templates.load(scenario_id).await {
            Ok(template) => template,
            Err(TemplateError::NotFound(_) | TemplateError::InvalidId(_)) => {
                return Err(ValidationError::UnknownScenario(scenario_id.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };
        assignment.validate(&template.infra)?;

        let run_id = self.core.registry.reserve(scenario_id, started_by)?;
        let job = Job::Provision(ProvisionRequest {
            run_id,
            scenario_id: scenario_id.to_string(),
            started_by: started_by.to_string(),
            template,
            assignment,
        });
        let job_id = match self.pool.submit(job).await {
            Ok(job_id) => job_id,
            Err(e) => {
                self.core.registry.release(run_id);
                return Err(e);
            }
        };
        tracing::info!("{started_by} started {scenario_id} as run {run_id}");
        self.core.events.publish(ScenarioEvent::ProvisioningStarted {
            run_id,
            scenario_id: scenario_id.to_string(),
            job_id,
        });
        Ok(StartedScenario { run_id, job_id })
    }

    pub async fn end_scenario(&self, run_id: Uuid) -> Result<EndedScenario, EngineError> {
        if let Err(e) = self.core.registry.begin_ending(run_id) {
            if matches!(e, ValidationError::UnknownRun(_))
                && self.core.store.get_archived_run(run_id).await?.is_some()
            {
                return Ok(EndedScenario::AlreadyEnded);
            }
            return Err(e.into());
        }
        match self
            .pool
            .submit(Job::Teardown(TeardownRequest { run_id }))
            .await
        {
            Ok(job_id) => {
                tracing::info!("Queued teardown of run {run_id}");
                Ok(EndedScenario::Queued { job_id })
            }
            Err(e) => {
                self.core.registry.abort_ending(run_id);
                Err(e)
            }
        }
    }

    pub async fn submit_flag(
        &self,
        participant_id: Uuid,
        item_id: &str,
        answer: &str,
    ) -> Result<FlagSubmission, EngineError> {
        let result = self
            .core
            .participants
            .submit_flag(participant_id, item_id, answer)
            .await?;
        if result.is_correct && !result.already_solved {
            self.core.events.publish(ScenarioEvent::FlagSolved {
                run_id: result.run_id,
                participant_id,
                item_id: item_id.to_string(),
                score: result.awarded_score,
            });
        }
        Ok(result)
    }

    pub async fn achieve_milestone(
        &self,
        participant_id: Uuid,
        item_id: &str,
        text: &str,
        evidence_files: &[String],
    ) -> Result<MilestoneSubmission, EngineError> {
        let result = self
            .core
            .participants
            .achieve_milestone(participant_id, item_id, text, evidence_files)
            .await?;
        self.core.events.publish(ScenarioEvent::MilestoneAchieved {
            run_id: result.run_id,
            participant_id,
            item_id: item_id.to_string(),
        });
        Ok(result)
    }

    pub async fn approve_milestone(
        &self,
        participant_id: Uuid,
        item_id: &str,
    ) -> Result<MilestoneReview, EngineError> {
        let result = self
            .core
            .participants
            .approve_milestone(participant_id, item_id)
            .await?;
        self.core.events.publish(ScenarioEvent::MilestoneApproved {
            run_id: result.run_id,
            participant_id,
            item_id: item_id.to_string(),
            score: result.awarded_score,
        });
        Ok(result)
    }

    pub async fn reject_milestone(
        &self,
        participant_id: Uuid,
        item_id: &str,
    ) -> Result<MilestoneReview, EngineError> {
        let result = self
            .core
            .participants
            .reject_milestone(participant_id, item_id)
            .await?;
        self.core.events.publish(ScenarioEvent::MilestoneRejected {
            run_id: result.run_id,
            participant_id,
            item_id: item_id.to_string(),
        });
        Ok(result)
    }

    pub async fn show_hint(
        &self,
        participant_id: Uuid,
        item_id: &str,
    ) -> Result<HintView, EngineError> {
        self.core
            .participants
            .show_hint(participant_id, item_id)
            .await
    }

    pub async fn toggle_lock(
        &self,
        participant_id: Uuid,
        target: &LockTarget,
        locked: bool,
    ) -> Result<LockChange, EngineError> {
        let change = self
            .core
            .participants
            .set_lock(participant_id, target, locked)
            .await?;
        if !change.changed.is_empty() {
            tracing::info!(
                "{} {:?} for participant {participant_id}",
                if locked { "Locked" } else { "Unlocked" },
                change.changed
            );
            self.core.events.publish(ScenarioEvent::ItemLockChanged {
                run_id: change.run_id,
                participant_id,
                item_ids: change.changed.clone(),
                locked,
            });
        }
        Ok(change)
    }

    pub async fn get_console(&self, participant_id: Uuid) -> Result<String, EngineError> {
        let participant = self.core.participants.get(participant_id).await?;
        let Some(instance_id) = participant.instance_id else {
            return Err(ValidationError::NoInstance(participant_id).into());
        };
        Ok(with_timeout(
            "get_console",
            self.core.op_timeout,
            self.core.cloud.get_console(&instance_id),
        )
        .await?)
    }

    /// Works for active and archived runs alike.
    pub async fn get_moderator_view(&self, run_id: Uuid) -> Result<ModeratorView, EngineError> {
        let state = self.core.registry.state(run_id);
        if state == Some(RunState::Provisioning) {
            return Err(ValidationError::StillProvisioning(run_id).into());
        }
        if let Some(run) = self.core.store.get_run(run_id).await? {
            let participants = self.core.participants.list(run_id).await?;
            return Ok(ModeratorView {
                run,
                state,
                participants,
            });
        }

        let Some(run) = self.core.store.get_archived_run(run_id).await? else {
            return Err(ValidationError::UnknownRun(run_id).into());
        };
        let mut participants = vec![];
        for participant_id in run.participants.values() {
            if let Some(p) = self
                .core
                .store
                .get_archived_participant(*participant_id)
                .await?
            {
                participants.push(p);
            }
        }
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(ModeratorView {
            run,
            state: None,
            participants,
        })
    }

    pub fn get_job_status(&self, job_id: JobId) -> Result<JobStatus, EngineError> {
        self.pool
            .status(job_id)
            .ok_or_else(|| ValidationError::UnknownJob(job_id).into())
    }

    pub async fn get_participant_progress(
        &self,
        participant_id: Uuid,
    ) -> Result<ParticipantProgress, EngineError> {
        self.core.participants.get(participant_id).await
    }

    pub fn list_active_runs(&self) -> Vec<RunSummary> {
        self.core.registry.summaries()
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::assignment::fixtures::{assign, two_teams};
    use crate::clock::ManualClock;
    use crate::cloud::fake::FakeCloud;
    use crate::template::TeamRole;
    use crate::template::fixtures::template_store;

    struct Harness {
        orchestrator: Orchestrator,
        cloud: Arc<FakeCloud>,
        clock: Arc<ManualClock>,
    }

    async fn harness(cloud: FakeCloud) -> Harness {
        let cloud = Arc::new(cloud);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let orchestrator = OrchestratorBuilder::new(template_store(), cloud.clone())
            .clock(clock.clone())
            .workers(2)
            .op_timeout(Duration::from_secs(5))
            .build()
            .await
            .unwrap();
        Harness {
            orchestrator,
            cloud,
            clock,
        }
    }

    async fn wait_for_job(orchestrator: &Orchestrator, job_id: JobId) -> JobStatus {
        for _ in 0..400 {
            match orchestrator.get_job_status(job_id).unwrap() {
                JobStatus::Queued | JobStatus::Running => {
                    tokio::time::sleep(Duration::from_millis(5)).await
                }
                status => return status,
            }
        }
        panic!("job {job_id} did not finish");
    }

    async fn started(h: &Harness) -> ModeratorView {
        let started = h
            .orchestrator
            .start_scenario("web-breach", "admin", two_teams())
            .await
            .unwrap();
        assert_eq!(
            wait_for_job(&h.orchestrator, started.job_id).await,
            JobStatus::Completed
        );
        h.orchestrator
            .get_moderator_view(started.run_id)
            .await
            .unwrap()
    }

    fn participant_of(view: &ModeratorView, user_id: &str) -> Uuid {
        view.run.participants[user_id]
    }

    #[tokio::test]
    async fn test_start_scenario() {
        let h = harness(FakeCloud::new()).await;
        let mut events = h.orchestrator.subscribe();
        let view = started(&h).await;

        assert_eq!(view.state, Some(RunState::Active));
        assert_eq!(view.run.resources.len(), 10);
        assert!(view.run.provisioning_failures.is_empty());
        assert_eq!(view.run.team_groups, vec!["Team A", "Team B"]);
        assert_eq!(view.participants.len(), 4);

        let carol = view
            .participants
            .iter()
            .find(|p| p.user_id == "carol")
            .unwrap();
        assert_eq!(carol.team_group, "Team B");
        assert_eq!(carol.team_role, TeamRole::Red);
        let carol_vm = view
            .run
            .resources
            .iter()
            .find(|r| r.cloud_name == "team-b-attacker")
            .unwrap();
        assert_eq!(carol.instance_id.as_deref(), Some(carol_vm.cloud_id.as_str()));

        assert!(matches!(
            events.recv().await.unwrap(),
            ScenarioEvent::ProvisioningStarted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ScenarioEvent::ScenarioStarted {
                resources: 10,
                failures: 0,
                ..
            }
        ));

        let runs = h.orchestrator.list_active_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].started_by, "admin");
    }

    #[tokio::test]
    async fn test_rejects_second_run_while_provisioning() {
        let cloud = FakeCloud::new();
        cloud.set_delay(Duration::from_millis(50));
        let h = harness(cloud).await;

        let first = h
            .orchestrator
            .start_scenario("web-breach", "admin", two_teams())
            .await
            .unwrap();
        match h
            .orchestrator
            .start_scenario("web-breach", "admin", two_teams())
            .await
        {
            Err(EngineError::Validation(ValidationError::AlreadyRunning { owner, .. })) => {
                assert_eq!(owner, "admin")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            h.orchestrator.end_scenario(first.run_id).await,
            Err(EngineError::Validation(ValidationError::StillProvisioning(_)))
        ));
        assert!(matches!(
            h.orchestrator.get_moderator_view(first.run_id).await,
            Err(EngineError::Validation(ValidationError::StillProvisioning(_)))
        ));
        assert_eq!(
            wait_for_job(&h.orchestrator, first.job_id).await,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_owners_run_same_scenario_side_by_side() {
        let cloud = FakeCloud::new();
        cloud.set_delay(Duration::from_millis(10));
        let h = harness(cloud).await;

        let first = h
            .orchestrator
            .start_scenario("web-breach", "admin", two_teams())
            .await
            .unwrap();
        let second = h
            .orchestrator
            .start_scenario("web-breach", "other-admin", two_teams())
            .await
            .unwrap();
        assert_ne!(first.run_id, second.run_id);
        for job_id in [first.job_id, second.job_id] {
            assert_eq!(
                wait_for_job(&h.orchestrator, job_id).await,
                JobStatus::Completed
            );
        }
        assert_eq!(h.orchestrator.list_active_runs().len(), 2);
        assert_eq!(h.cloud.alive_names().len(), 20);

        // Ending one run leaves the other's resources alone
        let EndedScenario::Queued { job_id } =
            h.orchestrator.end_scenario(first.run_id).await.unwrap()
        else {
            panic!("teardown was not queued");
        };
        assert_eq!(
            wait_for_job(&h.orchestrator, job_id).await,
            JobStatus::Completed
        );
        assert_eq!(h.cloud.alive_names().len(), 10);
        let view = h
            .orchestrator
            .get_moderator_view(second.run_id)
            .await
            .unwrap();
        assert_eq!(view.state, Some(RunState::Active));
        assert_eq!(view.participants.len(), 4);
    }

    #[tokio::test]
    async fn test_start_validation() {
        let h = harness(FakeCloud::new()).await;
        assert!(matches!(
            h.orchestrator
                .start_scenario("no-such-scenario", "admin", two_teams())
                .await,
            Err(EngineError::Validation(ValidationError::UnknownScenario(_)))
        ));

        let partial = assign(&[("Team A", &[("attacker", "alice", TeamRole::Red)])]);
        assert!(matches!(
            h.orchestrator
                .start_scenario("web-breach", "admin", partial)
                .await,
            Err(EngineError::Validation(ValidationError::InvalidAssignment(_)))
        ));
        // Nothing was reserved or provisioned
        assert!(h.orchestrator.list_active_runs().is_empty());
        assert!(h.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_play_and_end() {
        let h = harness(FakeCloud::new()).await;
        let view = started(&h).await;
        let run_id = view.run.run_id;
        let alice = participant_of(&view, "alice");
        let bob = participant_of(&view, "bob");
        let mut events = h.orchestrator.subscribe();

        h.clock.advance_minutes(25);
        let result = h
            .orchestrator
            .submit_flag(alice, "initial-access", "FLAG{in}")
            .await
            .unwrap();
        assert_eq!(result.awarded_score, 90);
        assert!(matches!(
            events.recv().await.unwrap(),
            ScenarioEvent::FlagSolved { score: 90, .. }
        ));

        h.orchestrator
            .achieve_milestone(bob, "incident-report", "timeline", &[])
            .await
            .unwrap();
        let review = h
            .orchestrator
            .approve_milestone(bob, "incident-report")
            .await
            .unwrap();
        // Approved 25 minutes in, one decay interval
        assert_eq!(review.awarded_score, 140);

        let change = h
            .orchestrator
            .toggle_lock(alice, &LockTarget::Phase("exploit".into()), false)
            .await
            .unwrap();
        assert_eq!(change.changed, vec!["root"]);

        let console = h.orchestrator.get_console(alice).await.unwrap();
        assert!(console.starts_with("https://"));

        let ended = h.orchestrator.end_scenario(run_id).await.unwrap();
        let EndedScenario::Queued { job_id } = ended else {
            panic!("unexpected {ended:?}");
        };
        assert_eq!(
            wait_for_job(&h.orchestrator, job_id).await,
            JobStatus::Completed
        );
        assert!(h.cloud.alive_names().is_empty());
        assert!(h.orchestrator.list_active_runs().is_empty());

        // Archived progress survives the run
        let archived = h.orchestrator.get_moderator_view(run_id).await.unwrap();
        assert_eq!(archived.state, None);
        assert!(archived.run.end_time.is_some());
        let alice_progress = archived
            .participants
            .iter()
            .find(|p| p.user_id == "alice")
            .unwrap();
        assert_eq!(alice_progress.total_score, 90);

        assert!(matches!(
            h.orchestrator.get_participant_progress(alice).await,
            Err(EngineError::Validation(ValidationError::UnknownParticipant(_)))
        ));
        assert_eq!(
            h.orchestrator.end_scenario(run_id).await.unwrap(),
            EndedScenario::AlreadyEnded
        );
        assert!(matches!(
            h.orchestrator.end_scenario(Uuid::now_v7()).await,
            Err(EngineError::Validation(ValidationError::UnknownRun(_)))
        ));

        // The scenario can be started again
        started(&h).await;
    }

    #[tokio::test]
    async fn test_failed_machine_has_no_console() {
        let cloud = FakeCloud::new();
        cloud.fail_on("team-a-victim");
        let h = harness(cloud).await;
        let view = started(&h).await;

        assert_eq!(view.run.provisioning_failures.len(), 1);
        assert_eq!(view.run.provisioning_failures[0].logical_name, "victim");

        let bob = participant_of(&view, "bob");
        assert!(
            h.orchestrator
                .get_participant_progress(bob)
                .await
                .unwrap()
                .instance_id
                .is_none()
        );
        assert!(matches!(
            h.orchestrator.get_console(bob).await,
            Err(EngineError::Validation(ValidationError::NoInstance(_)))
        ));
        // Provisioning failures do not stop play
        let dave = participant_of(&view, "dave");
        assert!(h.orchestrator.get_console(dave).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let h = harness(FakeCloud::new()).await;
        assert!(matches!(
            h.orchestrator.get_job_status(Uuid::now_v7()),
            Err(EngineError::Validation(ValidationError::UnknownJob(_)))
        ));
        h.orchestrator.shutdown().await;
        assert!(matches!(
            h.orchestrator
                .start_scenario("web-breach", "admin", two_teams())
                .await,
            Err(EngineError::QueueClosed)
        ));
        assert!(h.orchestrator.list_active_runs().is_empty());
    }
}
