// Veritas Trust Engine: Automated Threat Response
// Maps detected threat events to graduated response actions: matches the
// event against response policies, picks an escalation strategy from
// severity and risk score, and executes each action independently so one
// failure never aborts the rest.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{SharedClock, SharedIdGenerator};
use crate::config::EngineConfig;
use crate::events::{EventBus, SecurityEvent};
use crate::models::ThreatSeverity;
use crate::storage::{KeyValueStore, ShardedMemoryStore};
use crate::utils::metrics::record_threat_response;

///////////////////////////////////////////////////////////////////////////////
// Threat model
///////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    BehaviorAnomaly,
    ImpossibleTravel,
    UntrustedDevice,
    CredentialStuffing,
    PrivilegeEscalation,
    KnownThreatSource,
    PolicyViolation,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub threat_type: ThreatType,
    pub severity: ThreatSeverity,
    pub risk_score: f64,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Log,
    NotifyUser,
    Challenge,
    RestrictSession,
    Block,
    AlertAdmin,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseAction::Log => "log",
            ResponseAction::NotifyUser => "notify_user",
            ResponseAction::Challenge => "challenge",
            ResponseAction::RestrictSession => "restrict_session",
            ResponseAction::Block => "block",
            ResponseAction::AlertAdmin => "alert_admin",
        }
    }
}

// Escalation posture chosen for an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStrategy {
    Passive,
    Active,
    Aggressive,
}

// Administrative rule describing how to react to a class of threats
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponsePolicy {
    pub id: String,
    pub name: String,
    // Event matches when its type is listed and its severity reaches the
    // threshold; an empty type list matches any threat type
    pub threat_types: Vec<ThreatType>,
    pub min_severity: ThreatSeverity,
    pub actions: Vec<ResponseAction>,
    pub auto_execute: bool,
}

impl ResponsePolicy {
    fn matches(&self, event: &ThreatEvent) -> bool {
        let type_match =
            self.threat_types.is_empty() || self.threat_types.contains(&event.threat_type);
        type_match && event.severity >= self.min_severity
    }

    // Specificity ranking for tie-breaking: a policy naming the exact threat
    // type beats a catch-all; among those, the higher severity floor wins
    fn specificity(&self) -> (usize, u8) {
        let named = if self.threat_types.is_empty() { 0 } else { 1 };
        (named, self.min_severity.escalation_level())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionExecution {
    pub action: ResponseAction,
    pub success: bool,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreatResponse {
    pub id: String,
    pub event_id: String,
    pub user_id: String,
    pub policy_id: Option<String>,
    pub strategy: ResponseStrategy,
    pub executions: Vec<ActionExecution>,
    pub escalation_level: u8,
    pub requires_human_review: bool,
    pub responded_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("Action delivery failed: {0}")]
    Delivery(String),
}

///////////////////////////////////////////////////////////////////////////////
// Action execution
///////////////////////////////////////////////////////////////////////////////

// Side-effect boundary for response actions; swapped for a recording double
// in tests
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: ResponseAction,
        event: &ThreatEvent,
    ) -> Result<(), ResponseError>;
}

// Default executor: turns actions into security events on the bus and logs
pub struct EventBusActionExecutor {
    bus: EventBus,
    clock: SharedClock,
}

impl EventBusActionExecutor {
    pub fn new(bus: EventBus, clock: SharedClock) -> Self {
        EventBusActionExecutor { bus, clock }
    }
}

#[async_trait]
impl ActionExecutor for EventBusActionExecutor {
    async fn execute(
        &self,
        action: ResponseAction,
        event: &ThreatEvent,
    ) -> Result<(), ResponseError> {
        let now = self.clock.now();
        match action {
            ResponseAction::Log => {
                info!(
                    "threat logged: user={} type={:?} severity={:?} score={:.2}",
                    event.user_id, event.threat_type, event.severity, event.risk_score
                );
            }
            ResponseAction::NotifyUser => {
                self.bus.publish(SecurityEvent::AdminAlert {
                    user_id: event.user_id.clone(),
                    severity: ThreatSeverity::Low,
                    message: format!("Security notice sent to user: {}", event.description),
                    timestamp: now,
                });
            }
            ResponseAction::Challenge => {
                self.bus.publish(SecurityEvent::ChallengeRequired {
                    user_id: event.user_id.clone(),
                    session_id: event.session_id.clone(),
                    challenge_type: "totp".to_string(),
                    timestamp: now,
                });
            }
            ResponseAction::RestrictSession => {
                self.bus.publish(SecurityEvent::SessionRestricted {
                    user_id: event.user_id.clone(),
                    session_id: event.session_id.clone(),
                    restrictions: vec!["read_only".to_string()],
                    timestamp: now,
                });
            }
            ResponseAction::Block => {
                self.bus.publish(SecurityEvent::SessionTerminated {
                    user_id: event.user_id.clone(),
                    session_id: event.session_id.clone(),
                    reason: event.description.clone(),
                    timestamp: now,
                });
            }
            ResponseAction::AlertAdmin => {
                self.bus.publish(SecurityEvent::AdminAlert {
                    user_id: event.user_id.clone(),
                    severity: event.severity,
                    message: event.description.clone(),
                    timestamp: now,
                });
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////
// Responder
///////////////////////////////////////////////////////////////////////////////

pub struct ThreatResponder {
    policies: parking_lot::RwLock<Vec<ResponsePolicy>>,
    executor: Arc<dyn ActionExecutor>,
    history: ShardedMemoryStore<VecDeque<ThreatResponse>>,
    history_limit: usize,
    clock: SharedClock,
    ids: SharedIdGenerator,
}

impl ThreatResponder {
    pub fn new(
        config: &EngineConfig,
        executor: Arc<dyn ActionExecutor>,
        clock: SharedClock,
        ids: SharedIdGenerator,
    ) -> Self {
        ThreatResponder {
            policies: parking_lot::RwLock::new(default_response_policies()),
            executor,
            history: ShardedMemoryStore::new(),
            history_limit: config.response_history_limit,
            clock,
            ids,
        }
    }

    pub fn upsert_policy(&self, policy: ResponsePolicy) {
        let mut policies = self.policies.write();
        policies.retain(|p| p.id != policy.id);
        policies.push(policy);
    }

    /// Process a threat event end to end: pick a policy, pick a strategy,
    /// execute the resulting action list, record the outcome.
    pub async fn process(&self, event: &ThreatEvent) -> ThreatResponse {
        let now = self.clock.now();
        let strategy = derive_strategy(event);

        let policy = {
            let policies = self.policies.read();
            policies
                .iter()
                .filter(|p| p.matches(event))
                .max_by_key(|p| p.specificity())
                .cloned()
        };

        let mut actions: Vec<ResponseAction> = match &policy {
            Some(policy) => policy.actions.clone(),
            None => vec![ResponseAction::Log],
        };

        // Strategy additions on top of the matched policy
        if strategy == ResponseStrategy::Aggressive && event.severity == ThreatSeverity::Critical {
            for extra in [ResponseAction::Block, ResponseAction::AlertAdmin] {
                if !actions.contains(&extra) {
                    actions.push(extra);
                }
            }
        }

        let auto_execute = policy.as_ref().map(|p| p.auto_execute).unwrap_or(true);

        let mut executions = Vec::with_capacity(actions.len());
        for action in &actions {
            if !auto_execute {
                executions.push(ActionExecution {
                    action: *action,
                    success: false,
                    detail: "pending manual approval".to_string(),
                });
                continue;
            }
            // Each action runs independently; a failure is captured and the
            // remaining actions still execute
            match self.executor.execute(*action, event).await {
                Ok(()) => executions.push(ActionExecution {
                    action: *action,
                    success: true,
                    detail: "executed".to_string(),
                }),
                Err(e) => {
                    warn!(
                        "response action failed: event={} action={} reason={}",
                        event.id,
                        action.as_str(),
                        e
                    );
                    executions.push(ActionExecution {
                        action: *action,
                        success: false,
                        detail: e.to_string(),
                    });
                }
            }
        }

        let requires_human_review = event.severity == ThreatSeverity::Critical
            || event.risk_score > 0.9
            || actions.contains(&ResponseAction::Block);

        let response = ThreatResponse {
            id: self.ids.next_id("response"),
            event_id: event.id.clone(),
            user_id: event.user_id.clone(),
            policy_id: policy.map(|p| p.id),
            strategy,
            executions,
            escalation_level: event.severity.escalation_level(),
            requires_human_review,
            responded_at: now,
        };

        info!(
            "threat response: user={} event={} strategy={:?} actions={} review={}",
            response.user_id,
            response.event_id,
            response.strategy,
            response.executions.len(),
            response.requires_human_review
        );
        record_threat_response(strategy_name(strategy), response.executions.len());

        self.append_history(&event.user_id, response.clone());
        response
    }

    pub fn history(&self, user_id: &str) -> Vec<ThreatResponse> {
        self.history
            .get(user_id)
            .map(|h| h.into_iter().collect())
            .unwrap_or_default()
    }

    fn append_history(&self, user_id: &str, response: ThreatResponse) {
        let limit = self.history_limit;
        self.history.update(user_id, &mut |existing| {
            let mut history = existing.unwrap_or_default();
            history.push_back(response.clone());
            while history.len() > limit {
                history.pop_front();
            }
            Some(history)
        });
    }
}

fn derive_strategy(event: &ThreatEvent) -> ResponseStrategy {
    if event.severity == ThreatSeverity::Critical || event.risk_score > 0.8 {
        ResponseStrategy::Aggressive
    } else if event.severity == ThreatSeverity::High || event.risk_score > 0.6 {
        ResponseStrategy::Active
    } else {
        ResponseStrategy::Passive
    }
}

fn strategy_name(strategy: ResponseStrategy) -> &'static str {
    match strategy {
        ResponseStrategy::Passive => "passive",
        ResponseStrategy::Active => "active",
        ResponseStrategy::Aggressive => "aggressive",
    }
}

pub fn default_response_policies() -> Vec<ResponsePolicy> {
    vec![
        ResponsePolicy {
            id: "critical-threat-lockdown".to_string(),
            name: "Lock down critical threats".to_string(),
            threat_types: Vec::new(),
            min_severity: ThreatSeverity::Critical,
            actions: vec![
                ResponseAction::Block,
                ResponseAction::AlertAdmin,
                ResponseAction::Log,
            ],
            auto_execute: true,
        },
        ResponsePolicy {
            id: "credential-stuffing-block".to_string(),
            name: "Block credential stuffing".to_string(),
            threat_types: vec![ThreatType::CredentialStuffing],
            min_severity: ThreatSeverity::High,
            actions: vec![ResponseAction::Block, ResponseAction::AlertAdmin],
            auto_execute: true,
        },
        ResponsePolicy {
            id: "high-threat-restrict".to_string(),
            name: "Restrict high-severity threats".to_string(),
            threat_types: Vec::new(),
            min_severity: ThreatSeverity::High,
            actions: vec![
                ResponseAction::RestrictSession,
                ResponseAction::NotifyUser,
                ResponseAction::Log,
            ],
            auto_execute: true,
        },
        ResponsePolicy {
            id: "travel-challenge".to_string(),
            name: "Challenge impossible travel".to_string(),
            threat_types: vec![ThreatType::ImpossibleTravel],
            min_severity: ThreatSeverity::Medium,
            actions: vec![ResponseAction::Challenge, ResponseAction::Log],
            auto_execute: true,
        },
        ResponsePolicy {
            id: "default-observe".to_string(),
            name: "Observe low-grade threats".to_string(),
            threat_types: Vec::new(),
            min_severity: ThreatSeverity::Low,
            actions: vec![ResponseAction::Log],
            auto_execute: true,
        },
    ]
}
