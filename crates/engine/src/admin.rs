// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::progress::ParticipantProgress;

/// What an admin lock or unlock applies to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum LockTarget {
    /// A single flag or milestone
    Item(String),
    /// Every item in the phase
    Phase(String),
}

/// Applies a lock transition to the participant's items in place.
///
/// Items already in the requested state are left untouched, so repeating a
/// toggle changes nothing. Unlocking moves the item's decay anchor to `now`.
/// Returns the ids of the items that actually changed.
pub fn apply_lock(
    participant: &mut ParticipantProgress,
    target: &LockTarget,
    locked: bool,
    now: DateTime<Utc>,
) -> Result<Vec<String>, ValidationError> {
    let participant_id = participant.participant_id;
    let matched: Vec<usize> = participant
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| match target {
            LockTarget::Item(item_id) => &item.item_id == item_id,
            LockTarget::Phase(phase_id) => item.phase_id.as_ref() == Some(phase_id),
        })
        .map(|(idx, _)| idx)
        .collect();

    if matched.is_empty() {
        return Err(match target {
            LockTarget::Item(item_id) => ValidationError::UnknownItem {
                participant_id,
                item_id: item_id.clone(),
            },
            LockTarget::Phase(phase_id) => ValidationError::UnknownPhase {
                participant_id,
                phase_id: phase_id.clone(),
            },
        });
    }

    let mut changed = vec![];
    for idx in matched {
        let item = &mut participant.items[idx];
        if item.locked_by_admin == locked {
            continue;
        }
        item.locked_by_admin = locked;
        item.visible = !locked;
        if !locked {
            item.first_visible_at = now;
            item.unlocked_at = Some(now);
        }
        changed.push(item.item_id.clone());
    }
    Ok(changed)
}
