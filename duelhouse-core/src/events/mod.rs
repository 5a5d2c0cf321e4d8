use crate::types::Outcome;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Everything the coordinator announces about a session, JSON-tagged for
/// the realtime surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    #[serde(rename = "room:countdown_started")]
    CountdownStarted {
        session_id: Uuid,
        ends_at: DateTime<Utc>,
    },
    #[serde(rename = "room:rollup_started")]
    RollupStarted { session_id: Uuid },
    #[serde(rename = "game:move_applied")]
    MoveApplied {
        session_id: Uuid,
        seq: u64,
        version: u64,
        hash: String,
        author: String,
    },
    #[serde(rename = "game:move_undone")]
    MoveUndone {
        session_id: Uuid,
        of_seq: u64,
        version: u64,
    },
    #[serde(rename = "game:ended")]
    Ended {
        session_id: Uuid,
        outcome: Outcome,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::CountdownStarted { session_id, .. }
            | Self::RollupStarted { session_id }
            | Self::MoveApplied { session_id, .. }
            | Self::MoveUndone { session_id, .. }
            | Self::Ended { session_id, .. } => *session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CountdownStarted { .. } => "room:countdown_started",
            Self::RollupStarted { .. } => "room:rollup_started",
            Self::MoveApplied { .. } => "game:move_applied",
            Self::MoveUndone { .. } => "game:move_undone",
            Self::Ended { .. } => "game:ended",
        }
    }
}

const TOPIC_CAPACITY: usize = 64;

/// Per-session broadcast topics. Publishing never blocks the producer; a
/// session with no subscribers drops its events. Slow subscribers lag and
/// lose the oldest events rather than slowing anyone down.
pub struct EventBroadcaster {
    topics: RwLock<HashMap<Uuid, broadcast::Sender<SessionEvent>>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<SessionEvent> {
        let mut topics = self.topics.write();
        topics
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        let topics = self.topics.read();
        if let Some(sender) = topics.get(&event.session_id()) {
            // send only fails when nobody is listening
            let _ = sender.send(event);
        }
    }

    pub fn drop_topic(&self, session_id: Uuid) {
        self.topics.write().remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let broadcaster = EventBroadcaster::new();
        let id = Uuid::new_v4();
        let mut rx = broadcaster.subscribe(id);

        for seq in 1..=3 {
            broadcaster.publish(SessionEvent::MoveApplied {
                session_id: id,
                seq,
                version: seq,
                hash: format!("h{}", seq),
                author: "alice".to_string(),
            });
        }

        for expected in 1..=3u64 {
            match rx.recv().await.unwrap() {
                SessionEvent::MoveApplied { seq, .. } => assert_eq!(seq, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_a_no_op() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(SessionEvent::RollupStarted {
            session_id: Uuid::new_v4(),
        });
    }

    #[tokio::test]
    async fn test_topics_are_isolated_per_session() {
        let broadcaster = EventBroadcaster::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut rx_a = broadcaster.subscribe(a);
        let _rx_b = broadcaster.subscribe(b);

        broadcaster.publish(SessionEvent::RollupStarted { session_id: b });
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_event_json_names() {
        let event = SessionEvent::Ended {
            session_id: Uuid::new_v4(),
            outcome: Outcome::Draw,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"game:ended\""));
        assert_eq!(event.name(), "game:ended");
    }
}
