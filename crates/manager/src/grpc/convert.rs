// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Translation between engine types and their wire representation.

use std::collections::BTreeMap;

use cyberrange_engine::assignment::{Assignee, TeamAssignment};
use cyberrange_engine::cloner::{InfraResource, ProvisioningFailure, ResourceKind};
use cyberrange_engine::jobs::JobStatus;
use cyberrange_engine::orchestrator::ModeratorView;
use cyberrange_engine::progress::{ItemProgress, ParticipantProgress};
use cyberrange_engine::registry::{ActiveScenarioRun, RunState, RunSummary};
use cyberrange_engine::template::TeamRole;
use cyberrange_engine::{EngineError, ValidationError};
use tonic::Status;
use uuid::Uuid;

use super::api;

pub fn status(error: EngineError) -> Status {
    let message = error.to_string();
    match error {
        EngineError::Validation(validation) => match validation {
            ValidationError::UnknownScenario(_)
            | ValidationError::UnknownRun(_)
            | ValidationError::UnknownParticipant(_)
            | ValidationError::UnknownItem { .. }
            | ValidationError::UnknownPhase { .. }
            | ValidationError::UnknownJob(_) => Status::not_found(message),
            ValidationError::InvalidAssignment(_)
            | ValidationError::WrongItemKind { .. }
            | ValidationError::NoHint(_) => Status::invalid_argument(message),
            ValidationError::AlreadyRunning { .. }
            | ValidationError::AlreadyEnding(_)
            | ValidationError::StillProvisioning(_)
            | ValidationError::ItemLocked(_)
            | ValidationError::MilestoneNotAchieved(_)
            | ValidationError::MilestoneAlreadyApproved(_)
            | ValidationError::NoInstance(_) => Status::failed_precondition(message),
        },
        e if e.is_not_found() => Status::not_found(message),
        EngineError::ConcurrencyConflict(_) => Status::aborted(message),
        _ => {
            tracing::error!("Request failed: {message}");
            Status::internal(message)
        }
    }
}

pub fn parse_id(value: &str, field: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value.trim())
        .map_err(|_| Status::invalid_argument(format!("{field} is not a valid id")))
}

pub fn team_role_from_wire(value: i32) -> Result<TeamRole, Status> {
    match api::TeamRole::try_from(value) {
        Ok(api::TeamRole::Red) => Ok(TeamRole::Red),
        Ok(api::TeamRole::Blue) => Ok(TeamRole::Blue),
        Ok(api::TeamRole::Purple) => Ok(TeamRole::Purple),
        Ok(api::TeamRole::Yellow) => Ok(TeamRole::Yellow),
        Ok(api::TeamRole::Unspecified) | Err(_) => {
            Err(Status::invalid_argument("team_role must be set"))
        }
    }
}

pub fn team_role_to_wire(role: TeamRole) -> i32 {
    match role {
        TeamRole::Red => api::TeamRole::Red,
        TeamRole::Blue => api::TeamRole::Blue,
        TeamRole::Purple => api::TeamRole::Purple,
        TeamRole::Yellow => api::TeamRole::Yellow,
    }
    .into()
}

/// Machines and groups must be unique on the wire.
pub fn assignment_from_wire(groups: Vec<api::TeamGroup>) -> Result<TeamAssignment, Status> {
    let mut assignment = BTreeMap::new();
    for group in groups {
        let mut machines = BTreeMap::new();
        for seat in group.seats {
            let assignee = Assignee {
                user_id: seat.user_id,
                team_role: team_role_from_wire(seat.team_role)?,
            };
            if machines.insert(seat.machine.clone(), assignee).is_some() {
                return Err(Status::invalid_argument(format!(
                    "machine {} is assigned twice in {}",
                    seat.machine, group.name
                )));
            }
        }
        if assignment.insert(group.name.clone(), machines).is_some() {
            return Err(Status::invalid_argument(format!(
                "team group {} is listed twice",
                group.name
            )));
        }
    }
    Ok(TeamAssignment(assignment))
}

fn kind_name(kind: ResourceKind) -> String {
    match kind {
        ResourceKind::Network => "network",
        ResourceKind::Router => "router",
        ResourceKind::Instance => "instance",
    }
    .to_string()
}

fn run_state_name(state: RunState) -> String {
    match state {
        RunState::Provisioning => "provisioning",
        RunState::Active => "active",
        RunState::Ending => "ending",
    }
    .to_string()
}

fn resource(resource: InfraResource) -> api::Resource {
    api::Resource {
        team_group: resource.team_group,
        logical_name: resource.logical_name,
        cloud_name: resource.cloud_name,
        cloud_id: resource.cloud_id,
        kind: kind_name(resource.kind),
        role: resource.role.map(team_role_to_wire),
        ip: resource.ip,
    }
}

fn failure(failure: ProvisioningFailure) -> api::ProvisioningFailure {
    api::ProvisioningFailure {
        team_group: failure.team_group,
        logical_name: failure.logical_name,
        kind: kind_name(failure.kind),
        error: failure.error,
    }
}

fn run(run: ActiveScenarioRun) -> api::Run {
    api::Run {
        run_id: run.run_id.to_string(),
        scenario_id: run.scenario_id,
        started_by: run.started_by,
        start_time: run.start_time.timestamp(),
        end_time: run.end_time.map(|t| t.timestamp()),
        team_groups: run.team_groups,
        resources: run.resources.into_iter().map(resource).collect(),
        provisioning_failures: run.provisioning_failures.into_iter().map(failure).collect(),
    }
}

fn item(item: ItemProgress) -> api::Item {
    api::Item {
        kind: item.kind().as_str().to_string(),
        completed: item.is_completed(),
        score_meta: item
            .score_meta
            .as_ref()
            .and_then(|meta| serde_json::to_string(meta).ok()),
        item_id: item.item_id,
        phase_id: item.phase_id,
        base_score: item.base_score,
        visible: item.visible,
        locked_by_admin: item.locked_by_admin,
        attempts: item.attempts,
        hint_used: item.hint_used,
        obtained_score: item.obtained_score,
    }
}

pub fn participant(participant: ParticipantProgress) -> api::Participant {
    api::Participant {
        participant_id: participant.participant_id.to_string(),
        user_id: participant.user_id,
        run_id: participant.run_id.to_string(),
        team_role: team_role_to_wire(participant.team_role),
        team_group: participant.team_group,
        machine: participant.machine,
        instance_id: participant.instance_id,
        total_score: participant.total_score,
        total_possible: participant.total_possible,
        items: participant.items.into_iter().map(item).collect(),
    }
}

pub fn moderator_view(view: ModeratorView) -> api::ModeratorView {
    api::ModeratorView {
        run: Some(run(view.run)),
        state: view.state.map(run_state_name),
        participants: view.participants.into_iter().map(participant).collect(),
    }
}

pub fn run_summary(summary: RunSummary) -> api::RunSummary {
    api::RunSummary {
        run_id: summary.run_id.to_string(),
        scenario_id: summary.scenario_id,
        started_by: summary.started_by,
        state: run_state_name(summary.state),
    }
}

pub fn job_status(status: JobStatus) -> api::GetJobStatusResponse {
    let (state, reason) = match status {
        JobStatus::Queued => ("queued", None),
        JobStatus::Running => ("running", None),
        JobStatus::Completed => ("completed", None),
        JobStatus::Failed(reason) => ("failed", Some(reason)),
    };
    api::GetJobStatusResponse {
        state: state.to_string(),
        reason,
    }
}
