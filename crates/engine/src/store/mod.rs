// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;
use uuid::Uuid;

use crate::progress::ParticipantProgress;
use crate::registry::ActiveScenarioRun;

mod memory;
mod models;
mod postgres;
mod schema;

pub use memory::MemoryStore;
pub use postgres::{PgStore, run_migrations};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Failed to connect to database: {0}")]
    Connection(#[from] diesel::result::ConnectionError),
    #[error("Connection pool error: {0}")]
    Pool(String),
    #[error("Failed to run migrations: {0}")]
    Migration(String),
    #[error("Failed to (de)serialize document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Record {0} was modified concurrently")]
    Conflict(Uuid),
    #[error("Record {0} not found")]
    NotFound(Uuid),
    #[error("Failed to join Tokio task: {0}")]
    TokioJoin(#[from] tokio::task::JoinError),
}

/// Persistence for active runs, participant progress and their archives.
///
/// Participant updates are compare-and-swap on `version`: a replace only
/// succeeds when the stored version still equals the one the caller read.
/// Archive writes are upserts so teardown can be repeated safely.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn insert_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<ActiveScenarioRun>, StoreError>;
    async fn update_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError>;
    async fn list_runs(&self) -> Result<Vec<ActiveScenarioRun>, StoreError>;
    /// Returns whether a run was removed.
    async fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError>;
    async fn archive_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError>;
    async fn get_archived_run(&self, run_id: Uuid)
    -> Result<Option<ActiveScenarioRun>, StoreError>;

    async fn insert_participant(&self, participant: &ParticipantProgress)
    -> Result<(), StoreError>;
    async fn get_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<ParticipantProgress>, StoreError>;
    /// Ordered by user id.
    async fn list_participants(&self, run_id: Uuid)
    -> Result<Vec<ParticipantProgress>, StoreError>;
    /// Stores `participant` if the stored version is `expected_version` and
    /// returns the new version.
    async fn replace_participant(
        &self,
        participant: &ParticipantProgress,
        expected_version: u64,
    ) -> Result<u64, StoreError>;
    async fn delete_participant(&self, participant_id: Uuid) -> Result<bool, StoreError>;
    async fn archive_participant(&self, participant: &ParticipantProgress)
    -> Result<(), StoreError>;
    async fn get_archived_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<ParticipantProgress>, StoreError>;
}
