// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use cyberrange_engine::Orchestrator;
use cyberrange_engine::admin::LockTarget;
use cyberrange_engine::orchestrator::EndedScenario;
use cyberrange_engine::template::RepoTemplateStore;
use tonic::{Request, Response, Status};

use super::api::scenario_service_server::ScenarioService;
use super::api::{
    AchieveMilestoneRequest, AchieveMilestoneResponse, EndScenarioRequest, EndScenarioResponse,
    GetConsoleRequest, GetConsoleResponse, GetJobStatusRequest, GetJobStatusResponse,
    GetModeratorViewRequest, GetParticipantProgressRequest, ItemRequest, ListActiveRunsRequest,
    ListActiveRunsResponse, ListScenariosRequest, ListScenariosResponse, MilestoneReviewResponse,
    ModeratorView, Participant, ReloadScenariosRequest, ReloadScenariosResponse,
    ShowHintResponse, StartScenarioRequest, StartScenarioResponse, SubmitFlagRequest,
    SubmitFlagResponse, ToggleLockRequest, ToggleLockResponse, toggle_lock_request,
};
use super::convert::{self, parse_id, status};

pub struct ScenarioManager {
    pub orchestrator: Arc<Orchestrator>,
    pub templates: Arc<RepoTemplateStore>,
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, Status> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Status::invalid_argument(format!("{field} must be set")));
    }
    Ok(value)
}

#[tonic::async_trait]
impl ScenarioService for ScenarioManager {
    async fn start_scenario(
        &self,
        request: Request<StartScenarioRequest>,
    ) -> Result<Response<StartScenarioResponse>, Status> {
        let request = request.into_inner();
        let scenario_id = required(&request.scenario_id, "scenario_id")?;
        let started_by = required(&request.started_by, "started_by")?;
        let assignment = convert::assignment_from_wire(request.team_groups)?;
        let started = self
            .orchestrator
            .start_scenario(scenario_id, started_by, assignment)
            .await
            .map_err(status)?;
        Ok(Response::new(StartScenarioResponse {
            run_id: started.run_id.to_string(),
            job_id: started.job_id.to_string(),
            message: format!("Provisioning of {scenario_id} has been queued"),
        }))
    }

    async fn end_scenario(
        &self,
        request: Request<EndScenarioRequest>,
    ) -> Result<Response<EndScenarioResponse>, Status> {
        let run_id = parse_id(&request.into_inner().run_id, "run_id")?;
        let response = match self.orchestrator.end_scenario(run_id).await.map_err(status)? {
            EndedScenario::Queued { job_id } => EndScenarioResponse {
                job_id: Some(job_id.to_string()),
                already_ended: false,
                message: "Teardown has been queued".to_string(),
            },
            EndedScenario::AlreadyEnded => EndScenarioResponse {
                job_id: None,
                already_ended: true,
                message: "Run has already ended".to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn submit_flag(
        &self,
        request: Request<SubmitFlagRequest>,
    ) -> Result<Response<SubmitFlagResponse>, Status> {
        let request = request.into_inner();
        let participant_id = parse_id(&request.participant_id, "participant_id")?;
        let result = self
            .orchestrator
            .submit_flag(participant_id, &request.item_id, &request.answer)
            .await
            .map_err(status)?;
        Ok(Response::new(SubmitFlagResponse {
            is_correct: result.is_correct,
            awarded_score: result.awarded_score,
            total_obtained_score: result.total_obtained_score,
            attempts: result.attempts,
            already_solved: result.already_solved,
        }))
    }

    async fn achieve_milestone(
        &self,
        request: Request<AchieveMilestoneRequest>,
    ) -> Result<Response<AchieveMilestoneResponse>, Status> {
        let request = request.into_inner();
        let participant_id = parse_id(&request.participant_id, "participant_id")?;
        let result = self
            .orchestrator
            .achieve_milestone(
                participant_id,
                &request.item_id,
                &request.text,
                &request.evidence_files,
            )
            .await
            .map_err(status)?;
        Ok(Response::new(AchieveMilestoneResponse {
            attempts: result.attempts,
        }))
    }

    async fn approve_milestone(
        &self,
        request: Request<ItemRequest>,
    ) -> Result<Response<MilestoneReviewResponse>, Status> {
        let request = request.into_inner();
        let participant_id = parse_id(&request.participant_id, "participant_id")?;
        let review = self
            .orchestrator
            .approve_milestone(participant_id, &request.item_id)
            .await
            .map_err(status)?;
        Ok(Response::new(MilestoneReviewResponse {
            awarded_score: review.awarded_score,
            total_obtained_score: review.total_obtained_score,
        }))
    }

    async fn reject_milestone(
        &self,
        request: Request<ItemRequest>,
    ) -> Result<Response<MilestoneReviewResponse>, Status> {
        let request = request.into_inner();
        let participant_id = parse_id(&request.participant_id, "participant_id")?;
        let review = self
            .orchestrator
            .reject_milestone(participant_id, &request.item_id)
            .await
            .map_err(status)?;
        Ok(Response::new(MilestoneReviewResponse {
            awarded_score: review.awarded_score,
            total_obtained_score: review.total_obtained_score,
        }))
    }

    async fn show_hint(
        &self,
        request: Request<ItemRequest>,
    ) -> Result<Response<ShowHintResponse>, Status> {
        let request = request.into_inner();
        let participant_id = parse_id(&request.participant_id, "participant_id")?;
        let hint = self
            .orchestrator
            .show_hint(participant_id, &request.item_id)
            .await
            .map_err(status)?;
        Ok(Response::new(ShowHintResponse {
            text: hint.text,
            penalty: hint.penalty,
            newly_revealed: hint.newly_revealed,
        }))
    }

    async fn toggle_lock(
        &self,
        request: Request<ToggleLockRequest>,
    ) -> Result<Response<ToggleLockResponse>, Status> {
        let request = request.into_inner();
        let participant_id = parse_id(&request.participant_id, "participant_id")?;
        let target = match request.target {
            Some(toggle_lock_request::Target::ItemId(item_id)) => LockTarget::Item(item_id),
            Some(toggle_lock_request::Target::PhaseId(phase_id)) => LockTarget::Phase(phase_id),
            None => return Err(Status::invalid_argument("item_id or phase_id must be set")),
        };
        let change = self
            .orchestrator
            .toggle_lock(participant_id, &target, request.locked)
            .await
            .map_err(status)?;
        Ok(Response::new(ToggleLockResponse {
            changed_items: change.changed,
        }))
    }

    async fn get_console(
        &self,
        request: Request<GetConsoleRequest>,
    ) -> Result<Response<GetConsoleResponse>, Status> {
        let participant_id = parse_id(&request.into_inner().participant_id, "participant_id")?;
        let url = self
            .orchestrator
            .get_console(participant_id)
            .await
            .map_err(status)?;
        Ok(Response::new(GetConsoleResponse { url }))
    }

    async fn get_moderator_view(
        &self,
        request: Request<GetModeratorViewRequest>,
    ) -> Result<Response<ModeratorView>, Status> {
        let run_id = parse_id(&request.into_inner().run_id, "run_id")?;
        let view = self
            .orchestrator
            .get_moderator_view(run_id)
            .await
            .map_err(status)?;
        Ok(Response::new(convert::moderator_view(view)))
    }

    async fn get_participant_progress(
        &self,
        request: Request<GetParticipantProgressRequest>,
    ) -> Result<Response<Participant>, Status> {
        let participant_id = parse_id(&request.into_inner().participant_id, "participant_id")?;
        let progress = self
            .orchestrator
            .get_participant_progress(participant_id)
            .await
            .map_err(status)?;
        Ok(Response::new(convert::participant(progress)))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let job_id = parse_id(&request.into_inner().job_id, "job_id")?;
        let job_status = self.orchestrator.get_job_status(job_id).map_err(status)?;
        Ok(Response::new(convert::job_status(job_status)))
    }

    async fn list_active_runs(
        &self,
        _request: Request<ListActiveRunsRequest>,
    ) -> Result<Response<ListActiveRunsResponse>, Status> {
        let runs = self
            .orchestrator
            .list_active_runs()
            .into_iter()
            .map(convert::run_summary)
            .collect();
        Ok(Response::new(ListActiveRunsResponse { runs }))
    }

    /// ListScenarios returns the ids of all templates that load cleanly.
    async fn list_scenarios(
        &self,
        _request: Request<ListScenariosRequest>,
    ) -> Result<Response<ListScenariosResponse>, Status> {
        let scenario_ids = self
            .templates
            .available_scenarios()
            .await
            .map_err(|e| Status::internal(format!("Failed to list scenarios: {}", e)))?;
        Ok(Response::new(ListScenariosResponse { scenario_ids }))
    }

    async fn reload_scenarios(
        &self,
        request: Request<ReloadScenariosRequest>,
    ) -> Result<Response<ReloadScenariosResponse>, Status> {
        match request.into_inner().scenario_id {
            Some(scenario_id) => {
                tracing::info!("Reloading scenario {scenario_id}");
                self.templates.invalidate(&scenario_id).await;
            }
            None => {
                tracing::info!("Reloading all scenarios");
                self.templates.invalidate_all();
            }
        }
        Ok(Response::new(ReloadScenariosResponse {}))
    }
}
