// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use diesel::prelude::*;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use uuid::Uuid;

use super::models::{ActiveRunRow, ArchivedParticipantRow, ArchivedRunRow, ParticipantRow};
use super::schema::*;
use super::{Store, StoreError};
use crate::progress::ParticipantProgress;
use crate::registry::ActiveScenarioRun;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Applies pending migrations over a dedicated blocking connection.
pub async fn run_migrations(database_url: &str) -> Result<(), StoreError> {
    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut connection =
            AsyncConnectionWrapper::<AsyncPgConnection>::establish(&database_url)?;
        connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    })
    .await?
}

/// Postgres-backed store. Runs and participants are kept as JSONB documents
/// next to the few columns needed for lookups and version checks.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_connections)
            .build(manager)
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn insert_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError> {
        let row = ActiveRunRow::try_from(run)?;
        let mut conn = self.conn().await?;
        diesel::insert_into(active_scenario_runs::table)
            .values(&row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ActiveScenarioRun>, StoreError> {
        let mut conn = self.conn().await?;
        let document = active_scenario_runs::table
            .find(run_id)
            .select(active_scenario_runs::document)
            .first::<serde_json::Value>(&mut conn)
            .await
            .optional()?;
        Ok(document.map(serde_json::from_value).transpose()?)
    }

    async fn update_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError> {
        let row = ActiveRunRow::try_from(run)?;
        let mut conn = self.conn().await?;
        let updated = diesel::update(active_scenario_runs::table.find(run.run_id))
            .set(active_scenario_runs::document.eq(&row.document))
            .execute(&mut conn)
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(run.run_id));
        }
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<ActiveScenarioRun>, StoreError> {
        let mut conn = self.conn().await?;
        let documents = active_scenario_runs::table
            .order(active_scenario_runs::start_time.asc())
            .select(active_scenario_runs::document)
            .load::<serde_json::Value>(&mut conn)
            .await?;
        documents
            .into_iter()
            .map(|d| serde_json::from_value(d).map_err(StoreError::from))
            .collect()
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(active_scenario_runs::table.find(run_id))
            .execute(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn archive_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError> {
        let row = ArchivedRunRow::try_from(run)?;
        let mut conn = self.conn().await?;
        diesel::insert_into(archive_scenario_runs::table)
            .values(&row)
            .on_conflict(archive_scenario_runs::run_id)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_archived_run(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ActiveScenarioRun>, StoreError> {
        let mut conn = self.conn().await?;
        let document = archive_scenario_runs::table
            .find(run_id)
            .select(archive_scenario_runs::document)
            .first::<serde_json::Value>(&mut conn)
            .await
            .optional()?;
        Ok(document.map(serde_json::from_value).transpose()?)
    }

    async fn insert_participant(
        &self,
        participant: &ParticipantProgress,
    ) -> Result<(), StoreError> {
        let row = ParticipantRow::new(participant, participant.version)?;
        let mut conn = self.conn().await?;
        diesel::insert_into(participant_progress::table)
            .values(&row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<ParticipantProgress>, StoreError> {
        let mut conn = self.conn().await?;
        let row = participant_progress::table
            .find(participant_id)
            .select(ParticipantRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(ParticipantRow::into_progress).transpose()
    }

    async fn list_participants(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<ParticipantProgress>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = participant_progress::table
            .filter(participant_progress::run_id.eq(run_id))
            .order(participant_progress::user_id.asc())
            .select(ParticipantRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(ParticipantRow::into_progress).collect()
    }

    async fn replace_participant(
        &self,
        participant: &ParticipantProgress,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let id = participant.participant_id;
        let next = expected_version + 1;
        let row = ParticipantRow::new(participant, next)?;
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            participant_progress::table
                .filter(participant_progress::participant_id.eq(id))
                .filter(participant_progress::version.eq(expected_version as i64)),
        )
        .set((
            participant_progress::document.eq(&row.document),
            participant_progress::version.eq(row.version),
        ))
        .execute(&mut conn)
        .await?;
        if updated > 0 {
            return Ok(next);
        }

        let exists = participant_progress::table
            .find(id)
            .select(participant_progress::participant_id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?;
        match exists {
            Some(_) => Err(StoreError::Conflict(id)),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn delete_participant(&self, participant_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(participant_progress::table.find(participant_id))
            .execute(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn archive_participant(
        &self,
        participant: &ParticipantProgress,
    ) -> Result<(), StoreError> {
        let row = ArchivedParticipantRow::try_from(participant)?;
        let mut conn = self.conn().await?;
        diesel::insert_into(archive_participant_progress::table)
            .values(&row)
            .on_conflict(archive_participant_progress::participant_id)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_archived_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<ParticipantProgress>, StoreError> {
        let mut conn = self.conn().await?;
        let document = archive_participant_progress::table
            .find(participant_id)
            .select(archive_participant_progress::document)
            .first::<serde_json::Value>(&mut conn)
            .await
            .optional()?;
        Ok(document.map(serde_json::from_value).transpose()?)
    }
}
