// Veritas Trust Engine: Risk Aggregator
// Combines behavior, device, location, temporal, security-event and
// external-reputation factors into one normalized risk score, risk level and
// recommended action. Signal gathering fans out concurrently; a stalled
// dependency times out and falls back to a conservative default rather than
// blocking the assessment.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::behavior::{AnomalyCategory, BehaviorAnalysis};
use crate::clock::{SharedClock, SharedIdGenerator};
use crate::config::EngineConfig;
use crate::device::{DeviceRecord, DeviceTrustStore};
use crate::location::{LocationAnomaly, LocationIntelligence, LocationRisk, UserLocationHistory};
use crate::models::{clamp01, RecommendedAction, RiskLevel};
use crate::storage::KeyValueStore;
use crate::utils::metrics::record_degraded_lookup;

// Factor weights; must sum to 1.0
pub const WEIGHT_BEHAVIOR: f64 = 0.25;
pub const WEIGHT_DEVICE: f64 = 0.20;
pub const WEIGHT_LOCATION: f64 = 0.20;
pub const WEIGHT_TEMPORAL: f64 = 0.15;
pub const WEIGHT_SECURITY: f64 = 0.15;
pub const WEIGHT_EXTERNAL: f64 = 0.05;

// External signal gathering deadline
const SIGNAL_TIMEOUT: StdDuration = StdDuration::from_millis(800);

const LONG_SESSION_SECS: i64 = 8 * 3600;

///////////////////////////////////////////////////////////////////////////////
// Inputs and outputs
///////////////////////////////////////////////////////////////////////////////

// Facts about the session being assessed, gathered by the orchestrator
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    pub session_id: String,
    pub device_id: String,
    pub behavior: Option<BehaviorAnalysis>,
    pub session_duration_secs: i64,
    pub failed_auth_count: u32,
    pub privilege_escalation: bool,
    pub recent_security_events: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RiskFactors {
    pub behavior: f64,
    pub device: f64,
    pub location: f64,
    pub temporal: f64,
    pub security: f64,
    pub external: f64,
}

impl RiskFactors {
    pub fn weighted_total(&self) -> f64 {
        clamp01(
            self.behavior * WEIGHT_BEHAVIOR
                + self.device * WEIGHT_DEVICE
                + self.location * WEIGHT_LOCATION
                + self.temporal * WEIGHT_TEMPORAL
                + self.security * WEIGHT_SECURITY
                + self.external * WEIGHT_EXTERNAL,
        )
    }
}

// Append-only: recomputed per assessment call, never mutated after creation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub overall_score: f64,
    pub risk_level: RiskLevel,
    pub factors: RiskFactors,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub recommended_action: RecommendedAction,
    pub trust_delta: f64,
}

///////////////////////////////////////////////////////////////////////////////
// Aggregator
///////////////////////////////////////////////////////////////////////////////

pub struct RiskAggregator {
    location: Arc<LocationIntelligence>,
    devices: Arc<DeviceTrustStore>,
    history: Arc<dyn KeyValueStore<VecDeque<RiskAssessment>>>,
    history_limit: usize,
    clock: SharedClock,
    ids: SharedIdGenerator,
}

impl RiskAggregator {
    pub fn new(
        config: &EngineConfig,
        location: Arc<LocationIntelligence>,
        devices: Arc<DeviceTrustStore>,
        history: Arc<dyn KeyValueStore<VecDeque<RiskAssessment>>>,
        clock: SharedClock,
        ids: SharedIdGenerator,
    ) -> Self {
        RiskAggregator {
            location,
            devices,
            history,
            history_limit: config.assessment_history_limit,
            clock,
            ids,
        }
    }

    /// Run one full risk assessment for a session
    pub async fn score(
        &self,
        user_id: &str,
        ip: &str,
        session: &SessionContext,
        location_history: &UserLocationHistory,
    ) -> RiskAssessment {
        // Fan out the I/O-bound signals; each degrades independently on timeout
        let (location_risk, location_anomaly) = tokio::join!(
            self.location_risk_with_timeout(ip, location_history),
            self.location_anomaly_with_timeout(ip, location_history),
        );
        let device = self.devices.get(user_id, &session.device_id);

        let factors = RiskFactors {
            behavior: behavior_score(session.behavior.as_ref()),
            device: device_score(device.as_ref()),
            location: location_score(&location_risk, &location_anomaly),
            temporal: temporal_score(session),
            security: security_score(session),
            external: external_score(&location_risk),
        };

        let overall = factors.weighted_total();
        let risk_level = RiskLevel::from_score(overall);
        let confidence = assessment_confidence(session, device.as_ref(), &location_risk, &location_anomaly);
        let reasons = derive_reasons(session, &location_risk, &location_anomaly, device.as_ref());
        let recommended_action = derive_action(risk_level, session, &location_risk);
        let trust_delta = trust_delta(overall, &location_risk);

        let assessment = RiskAssessment {
            id: self.ids.next_id("risk"),
            user_id: user_id.to_string(),
            session_id: session.session_id.clone(),
            timestamp: self.clock.now(),
            overall_score: overall,
            risk_level,
            factors,
            confidence,
            reasons,
            recommended_action,
            trust_delta,
        };

        self.append_history(&assessment);
        assessment
    }

    /// Append-only assessment history for a session
    pub fn session_history(&self, session_id: &str) -> Vec<RiskAssessment> {
        self.history
            .get(session_id)
            .map(|h| h.into_iter().collect())
            .unwrap_or_default()
    }

    fn append_history(&self, assessment: &RiskAssessment) {
        let limit = self.history_limit;
        self.history
            .update(&assessment.session_id, &mut |current| {
                let mut history = current.unwrap_or_default();
                history.push_back(assessment.clone());
                while history.len() > limit {
                    history.pop_front();
                }
                Some(history)
            });
    }

    async fn location_risk_with_timeout(
        &self,
        ip: &str,
        history: &UserLocationHistory,
    ) -> LocationRisk {
        match timeout(SIGNAL_TIMEOUT, self.location.assess_risk(ip, history)).await {
            Ok(risk) => risk,
            Err(_) => {
                warn!("location risk lookup timed out for {}", ip);
                record_degraded_lookup("location_risk");
                LocationRisk {
                    risk_score: 0.5,
                    risk_level: RiskLevel::Medium,
                    factors: vec!["Location assessment timed out".to_string()],
                    trust_modifier: 0.0,
                }
            }
        }
    }

    async fn location_anomaly_with_timeout(
        &self,
        ip: &str,
        history: &UserLocationHistory,
    ) -> LocationAnomaly {
        match timeout(SIGNAL_TIMEOUT, self.location.detect_anomaly(ip, history)).await {
            Ok(anomaly) => anomaly,
            Err(_) => {
                warn!("location anomaly lookup timed out for {}", ip);
                record_degraded_lookup("location_anomaly");
                LocationAnomaly {
                    is_anomalous: false,
                    confidence: 0.1,
                    nearest_known_km: None,
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Sub-score formulas (all bounded to [0,1])
///////////////////////////////////////////////////////////////////////////////

fn behavior_score(analysis: Option<&BehaviorAnalysis>) -> f64 {
    match analysis {
        Some(analysis) => clamp01(
            analysis.anomalies.len() as f64 * 0.15 + (1.0 - analysis.confidence) * 0.2,
        ),
        // No behavioral signal yet: mildly elevated
        None => 0.3,
    }
}

fn device_score(device: Option<&DeviceRecord>) -> f64 {
    match device {
        Some(record) => clamp01(1.0 - record.trust_score),
        // Never-seen device
        None => 0.6,
    }
}

fn location_score(risk: &LocationRisk, anomaly: &LocationAnomaly) -> f64 {
    let travel = if anomaly.is_anomalous { 0.25 } else { 0.0 };
    clamp01(risk.risk_score + travel)
}

fn temporal_score(session: &SessionContext) -> f64 {
    let mut score: f64 = 0.05;
    if has_anomaly(session, AnomalyCategory::AccessHour) {
        score += 0.4;
    }
    if session.session_duration_secs > LONG_SESSION_SECS {
        score += 0.4;
    }
    clamp01(score)
}

fn security_score(session: &SessionContext) -> f64 {
    let failed = (session.failed_auth_count as f64 * 0.1).min(0.5);
    let escalation = if session.privilege_escalation { 0.4 } else { 0.0 };
    let events = (session.recent_security_events as f64 * 0.05).min(0.2);
    clamp01(failed + escalation + events)
}

fn external_score(risk: &LocationRisk) -> f64 {
    let reputation = risk
        .factors
        .iter()
        .any(|f| f.contains("Known threat") || f.contains("abuse"));
    if reputation {
        0.8
    } else {
        0.0
    }
}

fn has_anomaly(session: &SessionContext, category: AnomalyCategory) -> bool {
    session
        .behavior
        .as_ref()
        .map(|b| b.anomalies.iter().any(|a| a.category == category))
        .unwrap_or(false)
}

fn assessment_confidence(
    session: &SessionContext,
    device: Option<&DeviceRecord>,
    location_risk: &LocationRisk,
    anomaly: &LocationAnomaly,
) -> f64 {
    let mut confidence: f64 = 0.5;

    if let Some(behavior) = &session.behavior {
        if behavior.confidence > 0.7 {
            confidence += 0.2;
        }
    }
    if !location_risk
        .factors
        .iter()
        .any(|f| f.contains("unavailable") || f.contains("timed out"))
    {
        confidence += 0.1;
    }
    match device {
        Some(record) if record.usage_count >= 3 => {}
        // Novel device lowers certainty
        _ => confidence -= 0.15,
    }
    if anomaly.is_anomalous {
        // Novel location
        confidence -= 0.1;
    }

    confidence.clamp(0.1, 0.95)
}

fn derive_reasons(
    session: &SessionContext,
    location_risk: &LocationRisk,
    anomaly: &LocationAnomaly,
    device: Option<&DeviceRecord>,
) -> Vec<String> {
    let mut reasons = Vec::new();

    let anomaly_count = session
        .behavior
        .as_ref()
        .map(|b| b.anomalies.len())
        .unwrap_or(0);
    if anomaly_count > 3 {
        reasons.push(format!("{} behavioral anomalies detected", anomaly_count));
    }
    if location_risk.factors.iter().any(|f| f.contains("Known threat")) {
        reasons.push("Source address matches threat intelligence".to_string());
    }
    if session.failed_auth_count > 5 {
        reasons.push(format!(
            "{} failed authentication attempts",
            session.failed_auth_count
        ));
    }
    if session.privilege_escalation {
        reasons.push("Privilege escalation attempted".to_string());
    }
    if session.session_duration_secs > LONG_SESSION_SECS {
        reasons.push("Session active for more than 8 hours".to_string());
    }
    for factor in &location_risk.factors {
        if factor.contains("VPN") || factor.contains("Tor") {
            reasons.push(factor.clone());
        }
    }
    if device.is_none() {
        reasons.push("Unrecognized device".to_string());
    }
    if anomaly.is_anomalous {
        if let Some(km) = anomaly.nearest_known_km {
            reasons.push(format!("Access {:.0} km from any known location", km));
        }
    }

    reasons
}

fn derive_action(
    risk_level: RiskLevel,
    session: &SessionContext,
    location_risk: &LocationRisk,
) -> RecommendedAction {
    let anomaly_count = session
        .behavior
        .as_ref()
        .map(|b| b.anomalies.len())
        .unwrap_or(0);
    let high_threat_intel = location_risk
        .factors
        .iter()
        .any(|f| f.contains("Known threat") || f.contains("Tor"));

    match risk_level {
        RiskLevel::Critical => RecommendedAction::Block,
        RiskLevel::High => {
            if session.privilege_escalation || high_threat_intel {
                RecommendedAction::Restrict
            } else {
                RecommendedAction::Challenge
            }
        }
        RiskLevel::Medium => {
            if anomaly_count > 3 || session.failed_auth_count > 3 {
                RecommendedAction::Challenge
            } else {
                RecommendedAction::Monitor
            }
        }
        RiskLevel::Low => RecommendedAction::None,
    }
}

fn trust_delta(overall: f64, location_risk: &LocationRisk) -> f64 {
    let base = if overall < 0.3 {
        0.05
    } else if overall > 0.7 {
        -0.1
    } else {
        0.0
    };
    (base + location_risk.trust_modifier * 0.5).clamp(-0.2, 0.2)
}
