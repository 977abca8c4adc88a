// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use dashmap::DashMap;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::progress::ParticipantProgress;
use crate::registry::ActiveScenarioRun;

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    runs: DashMap<Uuid, ActiveScenarioRun>,
    archived_runs: DashMap<Uuid, ActiveScenarioRun>,
    participants: DashMap<Uuid, ParticipantProgress>,
    archived_participants: DashMap<Uuid, ParticipantProgress>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn insert_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError> {
        self.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ActiveScenarioRun>, StoreError> {
        Ok(self.runs.get(&run_id).map(|r| r.value().clone()))
    }

    async fn update_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError> {
        match self.runs.get_mut(&run.run_id) {
            Some(mut entry) => {
                *entry = run.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(run.run_id)),
        }
    }

    async fn list_runs(&self) -> Result<Vec<ActiveScenarioRun>, StoreError> {
        let mut runs: Vec<ActiveScenarioRun> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by_key(|r| r.start_time);
        Ok(runs)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.runs.remove(&run_id).is_some())
    }

    async fn archive_run(&self, run: &ActiveScenarioRun) -> Result<(), StoreError> {
        self.archived_runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_archived_run(
        &self,
        run_id: Uuid,
    ) -> Result<Option<ActiveScenarioRun>, StoreError> {
        Ok(self.archived_runs.get(&run_id).map(|r| r.value().clone()))
    }

    async fn insert_participant(
        &self,
        participant: &ParticipantProgress,
    ) -> Result<(), StoreError> {
        self.participants
            .insert(participant.participant_id, participant.clone());
        Ok(())
    }

    async fn get_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<ParticipantProgress>, StoreError> {
        Ok(self.participants.get(&participant_id).map(|p| p.value().clone()))
    }

    async fn list_participants(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<ParticipantProgress>, StoreError> {
        let mut participants: Vec<ParticipantProgress> = self
            .participants
            .iter()
            .filter(|p| p.run_id == run_id)
            .map(|p| p.value().clone())
            .collect();
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(participants)
    }

    async fn replace_participant(
        &self,
        participant: &ParticipantProgress,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let id = participant.participant_id;
        let Some(mut entry) = self.participants.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        if entry.version != expected_version {
            return Err(StoreError::Conflict(id));
        }
        let next = expected_version + 1;
        let mut stored = participant.clone();
        stored.version = next;
        *entry = stored;
        Ok(next)
    }

    async fn delete_participant(&self, participant_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.participants.remove(&participant_id).is_some())
    }

    async fn archive_participant(
        &self,
        participant: &ParticipantProgress,
    ) -> Result<(), StoreError> {
        self.archived_participants
            .insert(participant.participant_id, participant.clone());
        Ok(())
    }

    async fn get_archived_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<ParticipantProgress>, StoreError> {
        Ok(self
            .archived_participants
            .get(&participant_id)
            .map(|p| p.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::progress::NewParticipant;
    use crate::template::TeamRole;
    use crate::template::fixtures::range_template;

    fn participant(run_id: Uuid, user_id: &str) -> ParticipantProgress {
        let template = range_template();
        ParticipantProgress::new(
            NewParticipant {
                run_id,
                scenario_id: &template.id,
                user_id,
                team_role: TeamRole::Red,
                team_group: "Team A",
                machine: "attacker",
                instance_id: None,
            },
            &template.items_for_role(TeamRole::Red),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_replace_checks_version() {
        let store = MemoryStore::new();
        let mut p = participant(Uuid::now_v7(), "alice");
        store.insert_participant(&p).await.unwrap();

        p.total_score = 10;
        assert_eq!(store.replace_participant(&p, 0).await.unwrap(), 1);
        // Stale writer still holding version 0
        assert!(matches!(
            store.replace_participant(&p, 0).await,
            Err(StoreError::Conflict(_))
        ));

        let stored = store
            .get_participant(p.participant_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.total_score, 10);
    }

    #[tokio::test]
    async fn test_replace_missing() {
        let store = MemoryStore::new();
        let p = participant(Uuid::now_v7(), "alice");
        assert!(matches!(
            store.replace_participant(&p, 0).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_participants_by_run() {
        let store = MemoryStore::new();
        let run_id = Uuid::now_v7();
        store
            .insert_participant(&participant(run_id, "bob"))
            .await
            .unwrap();
        store
            .insert_participant(&participant(run_id, "alice"))
            .await
            .unwrap();
        store
            .insert_participant(&participant(Uuid::now_v7(), "carol"))
            .await
            .unwrap();

        let users: Vec<String> = store
            .list_participants(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(users, vec!["alice", "bob"]);
    }
}
