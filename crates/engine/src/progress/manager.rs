// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use super::{ItemDetail, ItemProgress, NewParticipant, ParticipantProgress, Submission};
use crate::admin::{LockTarget, apply_lock};
use crate::assignment::Seat;
use crate::clock::Clock;
use crate::error::{EngineError, ValidationError};
use crate::scoring::{EventContext, score};
use crate::store::{Store, StoreError};
use crate::template::{ItemKind, ScenarioTemplate, TemplateItem, TemplateStore};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FlagSubmission {
    pub run_id: Uuid,
    pub is_correct: bool,
    pub awarded_score: u32,
    pub total_obtained_score: u32,
    pub attempts: u32,
    /// The flag was solved before this submission; nothing was recorded
    pub already_solved: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HintView {
    pub text: String,
    pub penalty: u32,
    /// False when the hint had been revealed before
    pub newly_revealed: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MilestoneSubmission {
    pub run_id: Uuid,
    pub attempts: u32,
    pub total_texts: usize,
    pub total_evidence_files: usize,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MilestoneReview {
    pub run_id: Uuid,
    pub awarded_score: u32,
    pub total_obtained_score: u32,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LockChange {
    pub run_id: Uuid,
    /// Items whose lock state actually changed
    pub changed: Vec<String>,
}

/// Result of a mutation attempt. Unchanged results skip the write.
enum Change<T> {
    Applied(T),
    Unchanged(T),
}

fn unknown_item(participant_id: Uuid, item_id: &str) -> ValidationError {
    ValidationError::UnknownItem {
        participant_id,
        item_id: item_id.to_string(),
    }
}

fn wrong_kind(item_id: &str, expected: ItemKind) -> ValidationError {
    ValidationError::WrongItemKind {
        item_id: item_id.to_string(),
        expected: expected.as_str(),
    }
}

fn find_item<'p>(
    participant: &'p mut ParticipantProgress,
    item_id: &str,
) -> Result<&'p mut ItemProgress, ValidationError> {
    let participant_id = participant.participant_id;
    participant
        .item_mut(item_id)
        .ok_or_else(|| unknown_item(participant_id, item_id))
}

/// Like `find_item`, but rejects items an admin has locked.
fn playable_item<'p>(
    participant: &'p mut ParticipantProgress,
    item_id: &str,
) -> Result<&'p mut ItemProgress, ValidationError> {
    let item = find_item(participant, item_id)?;
    if item.locked_by_admin {
        return Err(ValidationError::ItemLocked(item_id.to_string()));
    }
    Ok(item)
}

/// Owns every change to participant progress.
///
/// Each operation reads the participant, applies the change, recomputes the
/// totals and writes back only if nobody else wrote in between. Lost races
/// are retried from a fresh read.
///
/// Answers, hints and scoring come from the template a run was started with,
/// so reloading templates does not affect runs in progress.
pub struct ParticipantStateManager {
    store: Arc<dyn Store>,
    templates: Arc<dyn TemplateStore>,
    /// run id -> template snapshot
    run_templates: DashMap<Uuid, Arc<ScenarioTemplate>>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl ParticipantStateManager {
    pub fn new(
        store: Arc<dyn Store>,
        templates: Arc<dyn TemplateStore>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            templates,
            run_templates: DashMap::new(),
            clock,
            max_retries,
        }
    }

    pub async fn init_participant(
        &self,
        run_id: Uuid,
        template: &Arc<ScenarioTemplate>,
        seat: &Seat<'_>,
        instance_id: Option<String>,
    ) -> Result<ParticipantProgress, EngineError> {
        self.run_templates
            .entry(run_id)
            .or_insert_with(|| template.clone());
        let role = seat.assignee.team_role;
        let participant = ParticipantProgress::new(
            NewParticipant {
                run_id,
                scenario_id: &template.id,
                user_id: &seat.assignee.user_id,
                team_role: role,
                team_group: seat.team_group,
                machine: seat.machine,
                instance_id,
            },
            &template.items_for_role(role),
            self.clock.now(),
        );
        self.store.insert_participant(&participant).await?;
        tracing::debug!(
            "Initialised participant {} ({}) with {} items",
            participant.participant_id,
            participant.user_id,
            participant.items.len()
        );
        Ok(participant)
    }

    pub async fn get(&self, participant_id: Uuid) -> Result<ParticipantProgress, EngineError> {
        self.store
            .get_participant(participant_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownParticipant(participant_id).into())
    }

    pub async fn list(&self, run_id: Uuid) -> Result<Vec<ParticipantProgress>, EngineError> {
        Ok(self.store.list_participants(run_id).await?)
    }

    /// Drops the template snapshot of a run that has ended.
    pub fn forget_run(&self, run_id: Uuid) {
        self.run_templates.remove(&run_id);
    }

    /// The template a run plays. Runs restored after a restart take the
    /// current template and keep it from then on.
    async fn run_template(
        &self,
        participant: &ParticipantProgress,
    ) -> Result<Arc<ScenarioTemplate>, EngineError> {
        if let Some(template) = self.run_templates.get(&participant.run_id) {
            return Ok(template.value().clone());
        }
        let template = self.templates.load(&participant.scenario_id).await?;
        Ok(self
            .run_templates
            .entry(participant.run_id)
            .or_insert(template)
            .value()
            .clone())
    }

    /// The template item behind a participant's item, with the template's scoring.
    async fn template_item(
        &self,
        participant_id: Uuid,
        item_id: &str,
    ) -> Result<(Arc<ScenarioTemplate>, TemplateItem), EngineError> {
        let participant = self.get(participant_id).await?;
        if participant.item(item_id).is_none() {
            return Err(unknown_item(participant_id, item_id).into());
        }
        let template = self.run_template(&participant).await?;
        let item = template
            .item(item_id)
            .cloned()
            .ok_or_else(|| unknown_item(participant_id, item_id))?;
        Ok((template, item))
    }

    async fn mutate<T>(
        &self,
        participant_id: Uuid,
        mut apply: impl FnMut(&mut ParticipantProgress) -> Result<Change<T>, EngineError>,
    ) -> Result<(T, ParticipantProgress), EngineError> {
        for attempt in 0..=self.max_retries {
            let mut participant = self.get(participant_id).await?;
            let expected_version = participant.version;
            let out = match apply(&mut participant)? {
                Change::Unchanged(out) => return Ok((out, participant)),
                Change::Applied(out) => out,
            };
            participant.recompute_totals();
            match self
                .store
                .replace_participant(&participant, expected_version)
                .await
            {
                Ok(version) => {
                    participant.version = version;
                    return Ok((out, participant));
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(
                        "Participant {} changed concurrently, retrying (attempt {})",
                        participant_id,
                        attempt + 1
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(
            "Giving up on participant {} after {} conflicting updates",
            participant_id,
            self.max_retries + 1
        );
        Err(EngineError::ConcurrencyConflict(participant_id))
    }

    pub async fn submit_flag(
        &self,
        participant_id: Uuid,
        item_id: &str,
        answer: &str,
    ) -> Result<FlagSubmission, EngineError> {
        let (template, template_item) = self.template_item(participant_id, item_id).await?;
        let ((is_correct, awarded_score, already_solved), participant) = self
            .mutate(participant_id, |p| {
                let now = self.clock.now();
                let item = find_item(p, item_id)?;
                let locked = item.locked_by_admin;
                let ItemDetail::Flag(flag) = &mut item.detail else {
                    return Err(wrong_kind(item_id, ItemKind::Flag).into());
                };
                if flag.is_correct {
                    return Ok(Change::Unchanged((true, 0, true)));
                }
                if locked {
                    return Err(ValidationError::ItemLocked(item_id.to_string()).into());
                }

                let correct = template_item.check_answer(answer);
                item.attempts += 1;
                item.submitted_at = Some(now);
                flag.submissions.push(Submission {
                    text: answer.trim().to_string(),
                    at: now,
                    correct,
                });
                if !correct {
                    return Ok(Change::Applied((false, 0, false)));
                }

                let ctx = EventContext::between(item.first_visible_at, now)
                    .with_attempts(item.attempts)
                    .with_hint(item.hint_used, item.hint_penalty);
                let (awarded, meta) = score(item.base_score, &template.scoring, &ctx);
                flag.is_correct = true;
                item.achieved_at = Some(now);
                item.obtained_score = awarded;
                item.score_meta = Some(meta);
                Ok(Change::Applied((true, awarded, false)))
            })
            .await?;

        let attempts = participant.item(item_id).map_or(0, |i| i.attempts);
        Ok(FlagSubmission {
            run_id: participant.run_id,
            is_correct,
            awarded_score,
            total_obtained_score: participant.total_score,
            attempts,
            already_solved,
        })
    }

    /// Reveals the item's hint. Only the first reveal is recorded.
    pub async fn show_hint(
        &self,
        participant_id: Uuid,
        item_id: &str,
    ) -> Result<HintView, EngineError> {
        let (_, template_item) = self.template_item(participant_id, item_id).await?;
        let Some(hint) = template_item.hint else {
            return Err(ValidationError::NoHint(item_id.to_string()).into());
        };
        let (newly_revealed, _) = self
            .mutate(participant_id, |p| {
                let item = playable_item(p, item_id)?;
                if item.hint_used {
                    return Ok(Change::Unchanged(false));
                }
                item.hint_used = true;
                item.hint_text = Some(hint.text.clone());
                item.hint_penalty = hint.penalty;
                Ok(Change::Applied(true))
            })
            .await?;
        Ok(HintView {
            text: hint.text,
            penalty: hint.penalty,
            newly_revealed,
        })
    }

    /// Records a milestone claim. Texts and evidence accumulate across
    /// submissions; scoring waits for a moderator's approval.
    pub async fn achieve_milestone(
        &self,
        participant_id: Uuid,
        item_id: &str,
        text: &str,
        evidence_files: &[String],
    ) -> Result<MilestoneSubmission, EngineError> {
        let (submission, _) = self
            .mutate(participant_id, |p| {
                let now = self.clock.now();
                let run_id = p.run_id;
                let item = playable_item(p, item_id)?;
                let ItemDetail::Milestone(milestone) = &mut item.detail else {
                    return Err(wrong_kind(item_id, ItemKind::Milestone).into());
                };
                if milestone.is_approved {
                    return Err(ValidationError::MilestoneAlreadyApproved(item_id.to_string()).into());
                }

                item.attempts += 1;
                item.submitted_at = Some(now);
                if !milestone.is_achieved {
                    milestone.is_achieved = true;
                    item.achieved_at = Some(now);
                }
                if !text.trim().is_empty() {
                    milestone.submitted_text.push(text.to_string());
                }
                milestone.evidence_files.extend(evidence_files.iter().cloned());
                Ok(Change::Applied(MilestoneSubmission {
                    run_id,
                    attempts: item.attempts,
                    total_texts: milestone.submitted_text.len(),
                    total_evidence_files: milestone.evidence_files.len(),
                }))
            })
            .await?;
        Ok(submission)
    }

    /// Scores an achieved milestone as of the moment it was achieved.
    pub async fn approve_milestone(
        &self,
        participant_id: Uuid,
        item_id: &str,
    ) -> Result<MilestoneReview, EngineError> {
        let (template, _) = self.template_item(participant_id, item_id).await?;
        let (awarded_score, participant) = self
            .mutate(participant_id, |p| {
                let now = self.clock.now();
                let item = find_item(p, item_id)?;
                let ItemDetail::Milestone(milestone) = &mut item.detail else {
                    return Err(wrong_kind(item_id, ItemKind::Milestone).into());
                };
                if milestone.is_approved {
                    return Ok(Change::Unchanged(item.obtained_score));
                }
                if !milestone.is_achieved {
                    return Err(ValidationError::MilestoneNotAchieved(item_id.to_string()).into());
                }

                let achieved_at = item.achieved_at.unwrap_or(now);
                let ctx = EventContext::between(item.first_visible_at, achieved_at)
                    .with_attempts(item.attempts.max(1))
                    .with_hint(item.hint_used, item.hint_penalty);
                let (awarded, meta) = score(item.base_score, &template.scoring, &ctx);
                milestone.is_approved = true;
                milestone.approved_at = Some(now);
                item.obtained_score = awarded;
                item.score_meta = Some(meta);
                Ok(Change::Applied(awarded))
            })
            .await?;
        Ok(MilestoneReview {
            run_id: participant.run_id,
            awarded_score,
            total_obtained_score: participant.total_score,
        })
    }

    /// Sends a milestone back to the participant. Its score is withdrawn but
    /// everything they submitted is kept.
    pub async fn reject_milestone(
        &self,
        participant_id: Uuid,
        item_id: &str,
    ) -> Result<MilestoneReview, EngineError> {
        let (_, participant) = self
            .mutate(participant_id, |p| {
                let item = find_item(p, item_id)?;
                let ItemDetail::Milestone(milestone) = &mut item.detail else {
                    return Err(wrong_kind(item_id, ItemKind::Milestone).into());
                };
                if !milestone.is_achieved && !milestone.is_approved {
                    return Err(ValidationError::MilestoneNotAchieved(item_id.to_string()).into());
                }
                milestone.is_achieved = false;
                milestone.is_approved = false;
                milestone.approved_at = None;
                milestone.rejections += 1;
                item.achieved_at = None;
                item.obtained_score = 0;
                item.score_meta = None;
                Ok(Change::Applied(()))
            })
            .await?;
        Ok(MilestoneReview {
            run_id: participant.run_id,
            awarded_score: 0,
            total_obtained_score: participant.total_score,
        })
    }

    /// Locks or unlocks items for one participant in a single write.
    pub async fn set_lock(
        &self,
        participant_id: Uuid,
        target: &LockTarget,
        locked: bool,
    ) -> Result<LockChange, EngineError> {
        let (changed, participant) = self
            .mutate(participant_id, |p| {
                let changed = apply_lock(p, target, locked, self.clock.now())?;
                if changed.is_empty() {
                    Ok(Change::Unchanged(changed))
                } else {
                    Ok(Change::Applied(changed))
                }
            })
            .await?;
        Ok(LockChange {
            run_id: participant.run_id,
            changed,
        })
    }
}
