// Veritas Trust Engine: Security Event Bus
// Typed pub/sub channel for cross-component signaling. Delivery is
// fire-and-forget: publishing with no live subscriber is not an error, and
// slow subscribers miss events rather than applying backpressure to the
// assessment pipeline.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{RiskLevel, ThreatSeverity};

// Events the pipeline emits toward the notification layer and the
// security-operations consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityEvent {
    ChallengeRequired {
        user_id: String,
        session_id: String,
        challenge_type: String,
        timestamp: DateTime<Utc>,
    },
    SessionRestricted {
        user_id: String,
        session_id: String,
        restrictions: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    SessionTerminated {
        user_id: String,
        session_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    AdminAlert {
        user_id: String,
        severity: ThreatSeverity,
        message: String,
        timestamp: DateTime<Utc>,
    },
    CriticalAnomaly {
        user_id: String,
        session_id: String,
        risk_level: RiskLevel,
        timestamp: DateTime<Utc>,
    },
}

impl SecurityEvent {
    pub fn user_id(&self) -> &str {
        match self {
            SecurityEvent::ChallengeRequired { user_id, .. }
            | SecurityEvent::SessionRestricted { user_id, .. }
            | SecurityEvent::SessionTerminated { user_id, .. }
            | SecurityEvent::AdminAlert { user_id, .. }
            | SecurityEvent::CriticalAnomaly { user_id, .. } => user_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SecurityEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    // Best-effort publish: an error only means nobody is listening.
    pub fn publish(&self, event: SecurityEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!("security event dropped, no subscribers: {:?}", event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}
