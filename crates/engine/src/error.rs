// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;
use uuid::Uuid;

use crate::cloud::CloudError;
use crate::store::StoreError;
use crate::template::TemplateError;

/// Rejections raised synchronously, before any provisioning or mutation happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("Unknown run: {0}")]
    UnknownRun(Uuid),
    #[error("Unknown participant: {0}")]
    UnknownParticipant(Uuid),
    #[error("Unknown item {item_id} for participant {participant_id}")]
    UnknownItem { participant_id: Uuid, item_id: String },
    #[error("Unknown phase {phase_id} for participant {participant_id}")]
    UnknownPhase {
        participant_id: Uuid,
        phase_id: String,
    },
    #[error("Invalid team assignment: {0}")]
    InvalidAssignment(String),
    #[error("Scenario {scenario_id} is already running for {owner}")]
    AlreadyRunning { scenario_id: String, owner: String },
    #[error("Run {0} is already being torn down")]
    AlreadyEnding(Uuid),
    #[error("Run {0} is still being provisioned")]
    StillProvisioning(Uuid),
    #[error("Item {0} is locked")]
    ItemLocked(String),
    #[error("Item {item_id} is not a {expected}")]
    WrongItemKind {
        item_id: String,
        expected: &'static str,
    },
    #[error("Milestone {0} has not been achieved")]
    MilestoneNotAchieved(String),
    #[error("Milestone {0} has already been approved")]
    MilestoneAlreadyApproved(String),
    #[error("Item {0} has no hint")]
    NoHint(String),
    #[error("Participant {0} has no provisioned instance")]
    NoInstance(Uuid),
    #[error("Unknown job: {0}")]
    UnknownJob(Uuid),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    #[error("Cloud provisioning error: {0}")]
    Provisioning(#[from] CloudError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Participant {0} was modified concurrently too many times")]
    ConcurrencyConflict(Uuid),
    #[error("Job queue is closed")]
    QueueClosed,
    #[error("Teardown of run {0} was interrupted")]
    Interrupted(Uuid),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(
                ValidationError::UnknownScenario(_)
                    | ValidationError::UnknownRun(_)
                    | ValidationError::UnknownParticipant(_)
                    | ValidationError::UnknownItem { .. }
                    | ValidationError::UnknownPhase { .. }
                    | ValidationError::UnknownJob(_)
            ) | EngineError::Template(TemplateError::NotFound(_))
        )
    }
}
