// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scoring::ScoreMeta;
use crate::template::{ItemKind, TeamRole, TemplateItem};

mod manager;

pub use manager::{
    FlagSubmission, HintView, LockChange, MilestoneReview, MilestoneSubmission,
    ParticipantStateManager,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub text: String,
    pub at: DateTime<Utc>,
    pub correct: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FlagProgress {
    pub is_correct: bool,
    #[serde(default)]
    pub submissions: Vec<Submission>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MilestoneProgress {
    pub is_achieved: bool,
    pub is_approved: bool,
    pub approved_at: Option<DateTime<Utc>>,
    /// Kept across rejections
    #[serde(default)]
    pub submitted_text: Vec<String>,
    #[serde(default)]
    pub evidence_files: Vec<String>,
    #[serde(default)]
    pub rejections: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemDetail {
    Flag(FlagProgress),
    Milestone(MilestoneProgress),
}

/// Progress on one flag or milestone.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ItemProgress {
    pub item_id: String,
    pub phase_id: Option<String>,
    pub base_score: u32,
    pub visible: bool,
    pub locked_by_admin: bool,
    pub attempts: u32,
    pub hint_used: bool,
    pub hint_text: Option<String>,
    pub hint_penalty: u32,
    /// Origin of time decay, moved forward when an admin unlocks the item
    pub first_visible_at: DateTime<Utc>,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub achieved_at: Option<DateTime<Utc>>,
    pub obtained_score: u32,
    pub score_meta: Option<ScoreMeta>,
    pub detail: ItemDetail,
}

impl ItemProgress {
    pub fn new(item: &TemplateItem, now: DateTime<Utc>) -> Self {
        let detail = match item.kind {
            ItemKind::Flag => ItemDetail::Flag(FlagProgress::default()),
            ItemKind::Milestone => ItemDetail::Milestone(MilestoneProgress::default()),
        };
        Self {
            item_id: item.id.clone(),
            phase_id: item.phase_id.clone(),
            base_score: item.base_score,
            visible: !item.is_locked,
            locked_by_admin: item.is_locked,
            attempts: 0,
            hint_used: false,
            hint_text: None,
            hint_penalty: 0,
            first_visible_at: now,
            unlocked_at: None,
            submitted_at: None,
            achieved_at: None,
            obtained_score: 0,
            score_meta: None,
            detail,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self.detail {
            ItemDetail::Flag(_) => ItemKind::Flag,
            ItemDetail::Milestone(_) => ItemKind::Milestone,
        }
    }

    /// Whether the item has been scored and counts towards the total.
    pub fn is_completed(&self) -> bool {
        match &self.detail {
            ItemDetail::Flag(flag) => flag.is_correct,
            ItemDetail::Milestone(milestone) => milestone.is_approved,
        }
    }
}

/// One participant's progress through one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParticipantProgress {
    pub participant_id: Uuid,
    pub user_id: String,
    pub run_id: Uuid,
    pub scenario_id: String,
    pub team_role: TeamRole,
    pub team_group: String,
    /// Logical name of the machine the participant plays
    pub machine: String,
    /// None when the machine failed to provision
    pub instance_id: Option<String>,
    pub items: Vec<ItemProgress>,
    pub total_score: u32,
    pub total_possible: u32,
    /// Bumped on every stored update
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

pub struct NewParticipant<'a> {
    pub run_id: Uuid,
    pub scenario_id: &'a str,
    pub user_id: &'a str,
    pub team_role: TeamRole,
    pub team_group: &'a str,
    pub machine: &'a str,
    pub instance_id: Option<String>,
}

impl ParticipantProgress {
    pub fn new(new: NewParticipant<'_>, items: &[&TemplateItem], now: DateTime<Utc>) -> Self {
        let mut participant = Self {
            participant_id: Uuid::now_v7(),
            user_id: new.user_id.to_string(),
            run_id: new.run_id,
            scenario_id: new.scenario_id.to_string(),
            team_role: new.team_role,
            team_group: new.team_group.to_string(),
            machine: new.machine.to_string(),
            instance_id: new.instance_id,
            items: items.iter().map(|item| ItemProgress::new(item, now)).collect(),
            total_score: 0,
            total_possible: 0,
            version: 0,
            created_at: now,
        };
        participant.recompute_totals();
        participant
    }

    pub fn item(&self, item_id: &str) -> Option<&ItemProgress> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    pub fn item_mut(&mut self, item_id: &str) -> Option<&mut ItemProgress> {
        self.items.iter_mut().find(|i| i.item_id == item_id)
    }

    /// Totals are always derived from the item list, never adjusted incrementally.
    pub fn recompute_totals(&mut self) {
        self.total_score = self.items.iter().map(|i| i.obtained_score).sum();
        self.total_possible = self.items.iter().map(|i| i.base_score).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::fixtures::range_template;

    fn red_participant() -> ParticipantProgress {
        let template = range_template();
        ParticipantProgress::new(
            NewParticipant {
                run_id: Uuid::now_v7(),
                scenario_id: &template.id,
                user_id: "alice",
                team_role: TeamRole::Red,
                team_group: "Team A",
                machine: "attacker",
                instance_id: Some("vm-1".to_string()),
            },
            &template.items_for_role(TeamRole::Red),
            Utc::now(),
        )
    }

    #[test]
    fn test_init_participant() {
        let participant = red_participant();
        assert_eq!(participant.items.len(), 2);
        assert_eq!(participant.total_score, 0);
        assert_eq!(participant.total_possible, 300);

        let first = participant.item("initial-access").unwrap();
        assert!(first.visible);
        assert!(!first.locked_by_admin);
        assert_eq!(first.kind(), ItemKind::Flag);
        assert_eq!(first.first_visible_at, participant.created_at);

        let locked = participant.item("root").unwrap();
        assert!(!locked.visible);
        assert!(locked.locked_by_admin);
    }

    #[test]
    fn test_recompute_totals() {
        let mut participant = red_participant();
        participant.item_mut("initial-access").unwrap().obtained_score = 70;
        participant.item_mut("root").unwrap().obtained_score = 150;
        participant.recompute_totals();
        assert_eq!(participant.total_score, 220);
    }

    #[test]
    fn test_document_shape() {
        let participant = red_participant();
        let document = serde_json::to_value(&participant).unwrap();
        assert_eq!(document["items"][0]["detail"]["kind"], "flag");
        assert_eq!(document["team_role"], "RED");
        let back: ParticipantProgress = serde_json::from_value(document).unwrap();
        assert_eq!(back, participant);
    }
}
