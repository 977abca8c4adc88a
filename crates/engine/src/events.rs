// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScenarioEvent {
    ProvisioningStarted {
        run_id: Uuid,
        scenario_id: String,
        job_id: Uuid,
    },
    ScenarioStarted {
        run_id: Uuid,
        scenario_id: String,
        resources: usize,
        failures: usize,
    },
    ProvisioningFailed {
        run_id: Uuid,
        scenario_id: String,
        reason: String,
    },
    ScenarioEnded {
        run_id: Uuid,
        scenario_id: String,
        cleanup_failures: usize,
    },
    FlagSolved {
        run_id: Uuid,
        participant_id: Uuid,
        item_id: String,
        score: u32,
    },
    MilestoneAchieved {
        run_id: Uuid,
        participant_id: Uuid,
        item_id: String,
    },
    MilestoneApproved {
        run_id: Uuid,
        participant_id: Uuid,
        item_id: String,
        score: u32,
    },
    MilestoneRejected {
        run_id: Uuid,
        participant_id: Uuid,
        item_id: String,
    },
    ItemLockChanged {
        run_id: Uuid,
        participant_id: Uuid,
        item_ids: Vec<String>,
        locked: bool,
    },
}

/// Fan-out of scenario events. Publishing never blocks; subscribers that fall
/// behind lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ScenarioEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScenarioEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ScenarioEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::default();
        bus.publish(ScenarioEvent::MilestoneAchieved {
            run_id: Uuid::nil(),
            participant_id: Uuid::nil(),
            item_id: "lost".into(),
        });

        let mut rx = bus.subscribe();
        let event = ScenarioEvent::FlagSolved {
            run_id: Uuid::nil(),
            participant_id: Uuid::nil(),
            item_id: "root".into(),
            score: 120,
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_event_json() {
        let event = ScenarioEvent::ItemLockChanged {
            run_id: Uuid::nil(),
            participant_id: Uuid::nil(),
            item_ids: vec!["root".into()],
            locked: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "item_lock_changed");
        assert_eq!(json["item_ids"][0], "root");
    }
}
