// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Score computation for flags and milestones.
//!
//! Everything here is pure: the caller supplies the base score, the scenario's
//! scoring configuration and the context of the scoring event, and gets back
//! the final score together with a [`ScoreMeta`] breakdown for reporting.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecayMode {
    /// Decay by minutes elapsed since the item became visible
    Time,
    /// Decay by the number of attempts it took
    Attempt,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DecayConfig {
    pub mode: DecayMode,
    #[serde(default)]
    pub start_after_minutes: u32,
    #[serde(default)]
    pub interval_minutes: u32,
    pub penalty_per_interval: u32,
    #[serde(default)]
    pub min_score: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoringConfig {
    #[default]
    Standard,
    Decay(DecayConfig),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoringKind {
    Standard,
    Decay,
}

impl ScoringConfig {
    pub fn kind(&self) -> ScoringKind {
        match self {
            ScoringConfig::Standard => ScoringKind::Standard,
            ScoringConfig::Decay(_) => ScoringKind::Decay,
        }
    }
}

/// What happened when the item was scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    /// Time between the decay anchor and the scored event
    pub elapsed: TimeDelta,
    /// Attempts including the scored one
    pub attempts: u32,
    pub hint_used: bool,
    pub hint_penalty: u32,
}

impl EventContext {
    pub fn between(anchor: DateTime<Utc>, event_time: DateTime<Utc>) -> Self {
        Self {
            elapsed: event_time - anchor,
            attempts: 1,
            hint_used: false,
            hint_penalty: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_hint(mut self, hint_used: bool, hint_penalty: u32) -> Self {
        self.hint_used = hint_used;
        self.hint_penalty = hint_penalty;
        self
    }

    fn elapsed_minutes(&self) -> i64 {
        self.elapsed.num_minutes().max(0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScoreMeta {
    #[serde(rename = "type")]
    pub kind: ScoringKind,
    pub base_score: u32,
    pub mode: Option<DecayMode>,
    pub min_score: Option<u32>,
    pub elapsed_minutes: i64,
    pub attempts: u32,
    pub decayed: bool,
    pub decay_penalty: u32,
    pub hint_used: bool,
    pub hint_penalty: u32,
    pub hint_penalty_applied: bool,
    pub final_score: u32,
}

impl DecayConfig {
    /// Nominal penalty before the floor is applied.
    fn penalty(&self, ctx: &EventContext) -> i64 {
        let intervals = match self.mode {
            DecayMode::Time => {
                if self.interval_minutes == 0 {
                    return 0;
                }
                let elapsed = ctx.elapsed.num_seconds().max(0);
                let start_after = i64::from(self.start_after_minutes) * 60;
                if elapsed <= start_after {
                    return 0;
                }
                (elapsed - start_after) / (i64::from(self.interval_minutes) * 60)
            }
            DecayMode::Attempt => (i64::from(ctx.attempts) - 1).max(0),
        };
        intervals.saturating_mul(i64::from(self.penalty_per_interval))
    }
}

fn clamp_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

/// Computes the score awarded for an item.
///
/// The result always lies within `0..=base_score`. In decay mode the hint
/// penalty is taken after decay, and only while the decayed score is still
/// above the floor.
pub fn score(base_score: u32, config: &ScoringConfig, ctx: &EventContext) -> (u32, ScoreMeta) {
    let base = i64::from(base_score);
    let hint_penalty = if ctx.hint_used {
        i64::from(ctx.hint_penalty)
    } else {
        0
    };

    let (final_score, mode, min_score, decay_penalty, hint_applied) = match config {
        ScoringConfig::Standard => {
            let final_score = (base - hint_penalty).clamp(0, base);
            (final_score, None, None, 0, ctx.hint_used)
        }
        ScoringConfig::Decay(decay) => {
            let floor = i64::from(decay.min_score).min(base);
            let decay_penalty = decay.penalty(ctx);
            let decayed = (base - decay_penalty).max(floor);
            let hint_applied = ctx.hint_used && decayed > floor;
            let final_score = if hint_applied {
                (decayed - hint_penalty).max(floor)
            } else {
                decayed
            };
            (
                final_score,
                Some(decay.mode),
                Some(decay.min_score),
                decay_penalty,
                hint_applied,
            )
        }
    };

    let final_score = clamp_u32(final_score).min(base_score);
    let meta = ScoreMeta {
        kind: config.kind(),
        base_score,
        mode,
        min_score,
        elapsed_minutes: ctx.elapsed_minutes(),
        attempts: ctx.attempts,
        decayed: decay_penalty > 0,
        decay_penalty: clamp_u32(decay_penalty),
        hint_used: ctx.hint_used,
        hint_penalty: ctx.hint_penalty,
        hint_penalty_applied: hint_applied,
        final_score,
    };
    (final_score, meta)
}
