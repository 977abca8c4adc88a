// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::StoreError;
use super::schema::*;
use crate::progress::ParticipantProgress;
use crate::registry::ActiveScenarioRun;

/* =========================
 * ACTIVE RUNS
 * ========================= */

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = active_scenario_runs)]
pub struct ActiveRunRow {
    pub run_id: Uuid,
    pub scenario_id: String,
    pub started_by: String,
    pub start_time: DateTime<Utc>,
    pub document: serde_json::Value,
}

impl TryFrom<&ActiveScenarioRun> for ActiveRunRow {
    type Error = StoreError;

    fn try_from(run: &ActiveScenarioRun) -> Result<Self, Self::Error> {
        Ok(Self {
            run_id: run.run_id,
            scenario_id: run.scenario_id.clone(),
            started_by: run.started_by.clone(),
            start_time: run.start_time,
            document: serde_json::to_value(run)?,
        })
    }
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = archive_scenario_runs)]
pub struct ArchivedRunRow {
    pub run_id: Uuid,
    pub scenario_id: String,
    pub started_by: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub document: serde_json::Value,
    pub archived_at: DateTime<Utc>,
}

impl TryFrom<&ActiveScenarioRun> for ArchivedRunRow {
    type Error = StoreError;

    fn try_from(run: &ActiveScenarioRun) -> Result<Self, Self::Error> {
        Ok(Self {
            run_id: run.run_id,
            scenario_id: run.scenario_id.clone(),
            started_by: run.started_by.clone(),
            start_time: run.start_time,
            end_time: run.end_time,
            document: serde_json::to_value(run)?,
            archived_at: Utc::now(),
        })
    }
}

/* =========================
 * PARTICIPANTS
 * ========================= */

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = participant_progress)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ParticipantRow {
    pub participant_id: Uuid,
    pub run_id: Uuid,
    pub user_id: String,
    pub version: i64,
    pub document: serde_json::Value,
}

impl ParticipantRow {
    pub fn new(participant: &ParticipantProgress, version: u64) -> Result<Self, StoreError> {
        let mut document = serde_json::to_value(participant)?;
        document["version"] = version.into();
        Ok(Self {
            participant_id: participant.participant_id,
            run_id: participant.run_id,
            user_id: participant.user_id.clone(),
            version: version as i64,
            document,
        })
    }

    /// The column is authoritative for the version.
    pub fn into_progress(self) -> Result<ParticipantProgress, StoreError> {
        let mut participant: ParticipantProgress = serde_json::from_value(self.document)?;
        participant.version = self.version.max(0) as u64;
        Ok(participant)
    }
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = archive_participant_progress)]
pub struct ArchivedParticipantRow {
    pub participant_id: Uuid,
    pub run_id: Uuid,
    pub user_id: String,
    pub document: serde_json::Value,
    pub archived_at: DateTime<Utc>,
}

impl TryFrom<&ParticipantProgress> for ArchivedParticipantRow {
    type Error = StoreError;

    fn try_from(participant: &ParticipantProgress) -> Result<Self, Self::Error> {
        Ok(Self {
            participant_id: participant.participant_id,
            run_id: participant.run_id,
            user_id: participant.user_id.clone(),
            document: serde_json::to_value(participant)?,
            archived_at: Utc::now(),
        })
    }
}
