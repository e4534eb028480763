// Veritas Trust Engine: Trust Orchestrator
// Facade over the assessment pipeline. One call to assess_trust runs
// behavior analysis, device trust update, location intelligence, risk
// aggregation, policy evaluation, and threat response in order, and the
// continuous-monitoring loop re-enters the same pipeline on a timer for the
// lifetime of a session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::api::{BehaviorPersistence, InMemoryBehaviorStore};
use crate::behavior::BehaviorAnalyzer;
use crate::clock::{SharedClock, SharedIdGenerator, SystemClock, UuidIdGenerator};
use crate::config::EngineConfig;
use crate::device::{DeviceActivity, DeviceRecord, DeviceTrustStore};
use crate::events::{EventBus, SecurityEvent};
use crate::location::{
    GeoProvider, LocationIntelligence, StaticGeoProvider, StaticThreatIntelProvider,
    ThreatIntelProvider, UserLocationHistory,
};
use crate::models::{ChallengeType, PolicyDecision, RiskLevel, ThreatSeverity};
use crate::policy::{PolicyContext, PolicyEngine, PolicyEvaluationResult};
use crate::response::{
    ActionExecutor, EventBusActionExecutor, ThreatEvent, ThreatResponder, ThreatResponse,
    ThreatType,
};
use crate::risk::{
    RiskAggregator, RiskAssessment, SessionContext, WEIGHT_BEHAVIOR, WEIGHT_DEVICE,
    WEIGHT_EXTERNAL, WEIGHT_LOCATION, WEIGHT_SECURITY, WEIGHT_TEMPORAL,
};
use crate::storage::{KeyValueStore, ShardedMemoryStore};
use crate::telemetry::BehaviorMetrics;
use crate::utils::metrics::{record_assessment, set_active_monitors};

// Bounds on the per-user location history the orchestrator accumulates
const KNOWN_POINTS_LIMIT: usize = 20;
const KNOWN_COUNTRIES_LIMIT: usize = 10;

///////////////////////////////////////////////////////////////////////////////
// Inputs and outputs
///////////////////////////////////////////////////////////////////////////////

// Everything the caller knows about the request being assessed
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub session_id: String,
    pub device_id: String,
    pub device_fingerprint: String,
    pub ip: String,
    pub resource: String,
    pub roles: Vec<String>,
    pub behavior_metrics: Option<BehaviorMetrics>,
    pub session_duration_secs: i64,
    pub failed_auth_count: u32,
    pub privilege_escalation: bool,
    pub recent_security_events: u32,
}

// How intrusive the outcome is for the end user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UxImpact {
    Invisible,
    Moderate,
    Severe,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustSignal {
    pub name: String,
    pub score: f64,
    pub weight: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustAssessment {
    pub user_id: String,
    pub session_id: String,
    // Trust is the inverse of the aggregated risk
    pub score: f64,
    pub confidence: f64,
    pub signals: Vec<TrustSignal>,
    pub requires_step_up: bool,
    pub risk_factors: Vec<String>,
    pub ux_impact: UxImpact,
    pub decision: PolicyDecision,
    pub challenge_type: Option<ChallengeType>,
    pub restrictions: Vec<String>,
    pub risk: RiskAssessment,
    pub assessed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStop {
    Stopped,
    MaxDurationReached,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoringSummary {
    pub session_id: String,
    pub user_id: String,
    pub assessments: u32,
    pub peak_risk_score: f64,
    pub last_risk_level: Option<RiskLevel>,
    pub critical_alerts: u32,
    pub stop_reason: MonitorStop,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session {0} is already being monitored")]
    AlreadyMonitoring(String),
}

struct MonitorHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<MonitoringSummary>,
}

///////////////////////////////////////////////////////////////////////////////
// Orchestrator
///////////////////////////////////////////////////////////////////////////////

pub struct TrustOrchestrator {
    config: EngineConfig,
    analyzer: Arc<BehaviorAnalyzer>,
    devices: Arc<DeviceTrustStore>,
    location: Arc<LocationIntelligence>,
    aggregator: Arc<RiskAggregator>,
    policies: Arc<PolicyEngine>,
    responder: Arc<ThreatResponder>,
    bus: EventBus,
    location_histories: Arc<ShardedMemoryStore<UserLocationHistory>>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    clock: SharedClock,
}

impl TrustOrchestrator {
    /// Default wiring: system clock, UUID ids, in-memory persistence, keyless
    /// static providers. Embedding applications swap collaborators via
    /// `with_parts`.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let ids: SharedIdGenerator = Arc::new(UuidIdGenerator);
        let persistence: Arc<dyn BehaviorPersistence> = Arc::new(InMemoryBehaviorStore::new());
        let geo: Arc<dyn GeoProvider> = Arc::new(StaticGeoProvider::new());
        let intel: Arc<dyn ThreatIntelProvider> = Arc::new(StaticThreatIntelProvider);
        Self::with_parts(config, persistence, geo, intel, clock, ids)
    }

    pub fn with_parts(
        config: EngineConfig,
        persistence: Arc<dyn BehaviorPersistence>,
        geo: Arc<dyn GeoProvider>,
        intel: Arc<dyn ThreatIntelProvider>,
        clock: SharedClock,
        ids: SharedIdGenerator,
    ) -> Arc<Self> {
        let bus = EventBus::default();
        let analyzer = Arc::new(BehaviorAnalyzer::new(persistence, clock.clone()));
        let devices = Arc::new(DeviceTrustStore::new(
            &config,
            Arc::new(ShardedMemoryStore::new()),
            clock.clone(),
        ));
        let location = Arc::new(LocationIntelligence::new(
            &config,
            geo,
            intel,
            clock.clone(),
        ));
        let aggregator = Arc::new(RiskAggregator::new(
            &config,
            location.clone(),
            devices.clone(),
            Arc::new(ShardedMemoryStore::new()),
            clock.clone(),
            ids.clone(),
        ));
        let policies = Arc::new(PolicyEngine::with_default_policies(&config, clock.clone()));
        let executor: Arc<dyn ActionExecutor> =
            Arc::new(EventBusActionExecutor::new(bus.clone(), clock.clone()));
        let responder = Arc::new(ThreatResponder::new(&config, executor, clock.clone(), ids));

        Arc::new(TrustOrchestrator {
            config,
            analyzer,
            devices,
            location,
            aggregator,
            policies,
            responder,
            bus,
            location_histories: Arc::new(ShardedMemoryStore::new()),
            monitors: Mutex::new(HashMap::new()),
            clock,
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn policy_engine(&self) -> &PolicyEngine {
        &self.policies
    }

    pub fn threat_responder(&self) -> &ThreatResponder {
        &self.responder
    }

    /// Run the full pipeline once for a request and return the trust verdict.
    pub async fn assess_trust(&self, user_id: &str, context: &RequestContext) -> TrustAssessment {
        let started = std::time::Instant::now();
        let now = self.clock.now();

        // 1. Behavior: analyze this session's metrics against the baseline
        let (behavior, baseline) = match &context.behavior_metrics {
            Some(metrics) => {
                let (analysis, baseline) = self.analyzer.observe(metrics).await;
                (Some(analysis), baseline)
            }
            None => (None, None),
        };

        // 2. Location: resolve once; the aggregator reuses the cached profile
        let history = self
            .location_histories
            .get(user_id)
            .unwrap_or_default();
        let profile = self.location.resolve(&context.ip).await;
        let anomaly = self.location.detect_anomaly(&context.ip, &history).await;

        // 3. Device: fold this sighting into the trust record
        let location_known = if profile.is_private || profile.degraded {
            None
        } else {
            Some(
                history
                    .known_countries
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&profile.geo.country_code)),
            )
        };
        let hour_typical = match (&baseline, &context.behavior_metrics) {
            (Some(baseline), Some(metrics)) if !baseline.active_hours.is_empty() => {
                Some(baseline.active_hours.contains(&metrics.access_hour))
            }
            _ => None,
        };
        let device = self.devices.update(
            user_id,
            &context.device_id,
            &DeviceActivity {
                fingerprint: context.device_fingerprint.clone(),
                behavior_anomalous: behavior.as_ref().map(|b| b.is_anomaly),
                behavior_confidence: behavior.as_ref().map(|b| b.confidence).unwrap_or(0.0),
                location_known,
                location_confidence: profile.confidence,
                hour_typical,
            },
        );

        // 4. Risk aggregation
        let session = SessionContext {
            session_id: context.session_id.clone(),
            device_id: context.device_id.clone(),
            behavior: behavior.clone(),
            session_duration_secs: context.session_duration_secs,
            failed_auth_count: context.failed_auth_count,
            privilege_escalation: context.privilege_escalation,
            recent_security_events: context.recent_security_events,
        };
        let risk = self
            .aggregator
            .score(user_id, &context.ip, &session, &history)
            .await;
        record_assessment(risk.risk_level, started.elapsed().as_secs_f64());

        if risk.risk_level == RiskLevel::Critical {
            self.bus.publish(SecurityEvent::CriticalAnomaly {
                user_id: user_id.to_string(),
                session_id: context.session_id.clone(),
                risk_level: risk.risk_level,
                timestamp: now,
            });
        }

        // 5. Policy evaluation over the gathered facts
        let policy_context = PolicyContext {
            user_id: user_id.to_string(),
            session_id: context.session_id.clone(),
            roles: context.roles.clone(),
            resource: context.resource.clone(),
            risk_score: risk.overall_score,
            risk_level: Some(risk.risk_level),
            location: serde_json::json!({
                "country": profile.geo.country_code,
                "vpn_detected": profile.threat.is_vpn || profile.threat.is_proxy,
                "tor_detected": profile.threat.is_tor,
                "impossible_travel": anomaly.is_anomalous,
                "degraded": profile.degraded,
            }),
            device: serde_json::json!({
                "status": status_name(&device),
                "trust_score": device.trust_score,
                "usage_count": device.usage_count,
            }),
            behavior: serde_json::json!({
                "anomaly_count": behavior.as_ref().map(|b| b.anomalies.len()).unwrap_or(0),
                "is_anomaly": behavior.as_ref().map(|b| b.is_anomaly).unwrap_or(false),
                "confidence": behavior.as_ref().map(|b| b.confidence).unwrap_or(0.0),
            }),
            user_attributes: serde_json::Value::Null,
            timestamp: Some(now),
        };
        let evaluation = self.policies.evaluate(&policy_context);

        // 6. Threat response on deny or critical risk
        if evaluation.decision == PolicyDecision::Deny || risk.risk_level == RiskLevel::Critical {
            let event = ThreatEvent {
                id: risk.id.clone(),
                user_id: user_id.to_string(),
                session_id: context.session_id.clone(),
                threat_type: classify_threat(&risk, context),
                severity: severity_for(risk.risk_level),
                risk_score: risk.overall_score,
                description: risk
                    .reasons
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "Elevated session risk".to_string()),
                detected_at: now,
            };
            let response = self.responder.process(&event).await;
            info!(
                "threat response triggered from assessment: user={} strategy={:?}",
                user_id, response.strategy
            );
        }

        // 7. A clean assessment teaches the engine the user's location
        if risk.risk_level == RiskLevel::Low && !profile.is_private && !profile.degraded {
            self.remember_location(user_id, &profile.geo.country_code, profile.geo.point);
        }

        let signals = vec![
            signal("behavior", risk.factors.behavior, WEIGHT_BEHAVIOR),
            signal("device", risk.factors.device, WEIGHT_DEVICE),
            signal("location", risk.factors.location, WEIGHT_LOCATION),
            signal("temporal", risk.factors.temporal, WEIGHT_TEMPORAL),
            signal("security", risk.factors.security, WEIGHT_SECURITY),
            signal("external", risk.factors.external, WEIGHT_EXTERNAL),
        ];

        TrustAssessment {
            user_id: user_id.to_string(),
            session_id: context.session_id.clone(),
            score: 1.0 - risk.overall_score,
            confidence: risk.confidence.min(evaluation.confidence + 0.15),
            signals,
            requires_step_up: evaluation.decision >= PolicyDecision::Challenge,
            risk_factors: risk.reasons.clone(),
            ux_impact: ux_impact(evaluation.decision),
            decision: evaluation.decision,
            challenge_type: evaluation.challenge_type,
            restrictions: evaluation.restrictions.clone(),
            risk,
            assessed_at: now,
        }
    }

    /// Evaluate a policy context directly, outside a full assessment.
    pub fn evaluate_request(&self, context: &PolicyContext) -> PolicyEvaluationResult {
        self.policies.evaluate(context)
    }

    /// Hand a threat event straight to the responder.
    pub async fn process_threat_event(&self, event: &ThreatEvent) -> ThreatResponse {
        self.responder.process(event).await
    }

    /// Apply one device sighting without running the rest of the pipeline.
    pub fn update_device_trust(
        &self,
        user_id: &str,
        device_id: &str,
        activity: &DeviceActivity,
    ) -> DeviceRecord {
        self.devices.update(user_id, device_id, activity)
    }

    /// Re-assess a live session on a fixed interval until the session ends or
    /// the maximum monitoring duration elapses. A critical anomaly published
    /// on the bus short-circuits the wait and triggers an immediate
    /// re-assessment.
    pub fn start_continuous_monitoring(
        self: &Arc<Self>,
        user_id: &str,
        context: RequestContext,
    ) -> Result<(), OrchestratorError> {
        let session_id = context.session_id.clone();
        let mut monitors = self.monitors.lock();
        if monitors.contains_key(&session_id) {
            return Err(OrchestratorError::AlreadyMonitoring(session_id));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(monitor_loop(
            self.clone(),
            user_id.to_string(),
            context,
            shutdown_rx,
        ));
        monitors.insert(
            session_id.clone(),
            MonitorHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
        set_active_monitors(monitors.len());
        info!("continuous monitoring started: session={}", session_id);
        Ok(())
    }

    /// Stop monitoring a session and return the final summary. Returns None
    /// for sessions that were never monitored.
    pub async fn stop_continuous_monitoring(
        &self,
        session_id: &str,
    ) -> Option<MonitoringSummary> {
        let handle = {
            let mut monitors = self.monitors.lock();
            let handle = monitors.remove(session_id);
            set_active_monitors(monitors.len());
            handle
        }?;

        // The task may have already ended at its max-duration cutoff; the
        // join still yields its summary either way
        let _ = handle.shutdown.send(());
        match handle.task.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("monitor task join failed: session={} reason={}", session_id, e);
                None
            }
        }
    }

    pub fn active_monitor_count(&self) -> usize {
        self.monitors.lock().len()
    }

    /// One background eviction pass over every TTL cache the engine owns.
    pub fn sweep_caches(&self) -> usize {
        self.location.sweep_caches() + self.policies.sweep_cache()
    }

    fn remember_location(&self, user_id: &str, country_code: &str, point: Option<crate::models::GeoPoint>) {
        let country = country_code.to_string();
        self.location_histories.update(user_id, &mut |current| {
            let mut history = current.unwrap_or_default();
            if !history
                .known_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&country))
                && history.known_countries.len() < KNOWN_COUNTRIES_LIMIT
            {
                history.known_countries.push(country.clone());
            }
            if let Some(point) = point {
                let novel = history
                    .known_points
                    .iter()
                    .all(|known| known.distance_km(&point) > 50.0);
                if novel {
                    if history.known_points.len() >= KNOWN_POINTS_LIMIT {
                        history.known_points.remove(0);
                    }
                    history.known_points.push(point);
                }
            }
            Some(history)
        });
    }
}

///////////////////////////////////////////////////////////////////////////////
// Monitoring loop
///////////////////////////////////////////////////////////////////////////////

async fn monitor_loop(
    orchestrator: Arc<TrustOrchestrator>,
    user_id: String,
    context: RequestContext,
    mut shutdown: oneshot::Receiver<()>,
) -> MonitoringSummary {
    let interval_secs = orchestrator.config.monitor_interval_secs.max(1);
    let max_ticks =
        (orchestrator.config.monitor_max_duration_secs / interval_secs).max(1) as u32;

    // Re-assessments never re-submit the session's telemetry metrics; the
    // baseline absorbed them once at session start
    let mut monitor_context = context;
    monitor_context.behavior_metrics = None;

    let mut ticker = tokio::time::interval(StdDuration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; the loop starts at the interval
    ticker.tick().await;

    let mut bus_rx = orchestrator.bus.subscribe();
    let mut summary = MonitoringSummary {
        session_id: monitor_context.session_id.clone(),
        user_id: user_id.clone(),
        assessments: 0,
        peak_risk_score: 0.0,
        last_risk_level: None,
        critical_alerts: 0,
        stop_reason: MonitorStop::Stopped,
        started_at: orchestrator.clock.now(),
        ended_at: orchestrator.clock.now(),
    };
    let mut ticks = 0u32;
    let mut forced_since_tick = false;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                summary.stop_reason = MonitorStop::Stopped;
                break;
            }
            _ = ticker.tick() => {
                forced_since_tick = false;
                let assessment = orchestrator.assess_trust(&user_id, &monitor_context).await;
                apply_assessment(&mut summary, &assessment);
                ticks += 1;
                if ticks >= max_ticks {
                    info!(
                        "monitoring reached max duration: session={}",
                        summary.session_id
                    );
                    summary.stop_reason = MonitorStop::MaxDurationReached;
                    break;
                }
            }
            event = bus_rx.recv() => {
                match event {
                    Ok(SecurityEvent::CriticalAnomaly { session_id, .. })
                        if session_id == summary.session_id && !forced_since_tick =>
                    {
                        // Immediate re-evaluation; at most once per interval so
                        // a persistently critical session cannot spin the loop
                        forced_since_tick = true;
                        summary.critical_alerts += 1;
                        let assessment =
                            orchestrator.assess_trust(&user_id, &monitor_context).await;
                        apply_assessment(&mut summary, &assessment);
                    }
                    Ok(_) => {}
                    Err(_) => {}
                }
            }
        }
    }

    summary.ended_at = orchestrator.clock.now();
    info!(
        "monitoring ended: session={} assessments={} peak_risk={:.2} reason={:?}",
        summary.session_id, summary.assessments, summary.peak_risk_score, summary.stop_reason
    );
    summary
}

fn apply_assessment(summary: &mut MonitoringSummary, assessment: &TrustAssessment) {
    summary.assessments += 1;
    summary.last_risk_level = Some(assessment.risk.risk_level);
    if assessment.risk.overall_score > summary.peak_risk_score {
        summary.peak_risk_score = assessment.risk.overall_score;
    }
}

///////////////////////////////////////////////////////////////////////////////
// Derivations
///////////////////////////////////////////////////////////////////////////////

fn signal(name: &str, score: f64, weight: f64) -> TrustSignal {
    TrustSignal {
        name: name.to_string(),
        score,
        weight,
    }
}

fn status_name(device: &DeviceRecord) -> &'static str {
    match device.status {
        crate::models::TrustStatus::Learning => "learning",
        crate::models::TrustStatus::Trusted => "trusted",
        crate::models::TrustStatus::Suspicious => "suspicious",
        crate::models::TrustStatus::Blocked => "blocked",
    }
}

fn ux_impact(decision: PolicyDecision) -> UxImpact {
    match decision {
        PolicyDecision::Allow => UxImpact::Invisible,
        PolicyDecision::Challenge => UxImpact::Moderate,
        PolicyDecision::Restrict | PolicyDecision::Deny => UxImpact::Severe,
    }
}

fn severity_for(level: RiskLevel) -> ThreatSeverity {
    match level {
        RiskLevel::Low => ThreatSeverity::Low,
        RiskLevel::Medium => ThreatSeverity::Medium,
        RiskLevel::High => ThreatSeverity::High,
        RiskLevel::Critical => ThreatSeverity::Critical,
    }
}

fn classify_threat(risk: &RiskAssessment, context: &RequestContext) -> ThreatType {
    if risk
        .reasons
        .iter()
        .any(|r| r.contains("threat intelligence"))
    {
        ThreatType::KnownThreatSource
    } else if context.privilege_escalation {
        ThreatType::PrivilegeEscalation
    } else if context.failed_auth_count > 5 {
        ThreatType::CredentialStuffing
    } else if risk.reasons.iter().any(|r| r.contains("known location")) {
        ThreatType::ImpossibleTravel
    } else if risk.reasons.iter().any(|r| r.contains("behavioral")) {
        ThreatType::BehaviorAnomaly
    } else if risk.reasons.iter().any(|r| r.contains("device")) {
        ThreatType::UntrustedDevice
    } else {
        ThreatType::PolicyViolation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SequentialIdGenerator};
    use crate::location::{GeoData, LocationError, ThreatData};
    use crate::models::GeoPoint;
    use crate::policy::{Policy, PolicyScope};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FixedGeo(GeoData);

    #[async_trait]
    impl GeoProvider for FixedGeo {
        async fn lookup(&self, _ip: &str) -> Result<GeoData, LocationError> {
            Ok(self.0.clone())
        }
    }

    struct FixedThreat(ThreatData);

    #[async_trait]
    impl ThreatIntelProvider for FixedThreat {
        async fn lookup(&self, _ip: &str) -> Result<ThreatData, LocationError> {
            Ok(self.0.clone())
        }
    }

    fn geo_de() -> GeoData {
        GeoData {
            country: "Germany".to_string(),
            country_code: "DE".to_string(),
            region: None,
            city: Some("Berlin".to_string()),
            point: Some(GeoPoint::new(52.52, 13.405)),
            isp: Some("test-isp".to_string()),
            asn: Some(3320),
        }
    }

    fn orchestrator_with(threat: ThreatData) -> Arc<TrustOrchestrator> {
        let clock: SharedClock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
        ));
        let ids: SharedIdGenerator = Arc::new(SequentialIdGenerator::new());
        let mut config = EngineConfig::default();
        config.monitor_interval_secs = 1;
        config.monitor_max_duration_secs = 3;
        TrustOrchestrator::with_parts(
            config,
            Arc::new(InMemoryBehaviorStore::new()),
            Arc::new(FixedGeo(geo_de())),
            Arc::new(FixedThreat(threat)),
            clock,
            ids,
        )
    }

    fn benign_request() -> RequestContext {
        RequestContext {
            session_id: "sess-1".to_string(),
            device_id: "dev-1".to_string(),
            device_fingerprint: "fp-abc".to_string(),
            ip: "93.184.216.34".to_string(),
            resource: "/reports/quarterly".to_string(),
            roles: vec!["analyst".to_string()],
            behavior_metrics: None,
            session_duration_secs: 600,
            failed_auth_count: 0,
            privilege_escalation: false,
            recent_security_events: 0,
        }
    }

    #[tokio::test]
    async fn test_benign_session_is_allowed_invisibly() {
        let orchestrator = orchestrator_with(ThreatData::default());
        let assessment = orchestrator
            .assess_trust("user-1", &benign_request())
            .await;

        assert_eq!(assessment.decision, PolicyDecision::Allow);
        assert!(!assessment.requires_step_up);
        assert_eq!(assessment.ux_impact, UxImpact::Invisible);
        assert!(assessment.score > 0.5, "trust score {}", assessment.score);
        assert_eq!(assessment.signals.len(), 6);
        let weight_sum: f64 = assessment.signals.iter().map(|s| s.weight).sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_vpn_access_requires_step_up() {
        let orchestrator = orchestrator_with(ThreatData {
            is_vpn: true,
            ..Default::default()
        });
        let assessment = orchestrator
            .assess_trust("user-1", &benign_request())
            .await;

        assert_eq!(assessment.decision, PolicyDecision::Challenge);
        assert!(assessment.requires_step_up);
        assert_eq!(assessment.challenge_type, Some(ChallengeType::Totp));
        assert_eq!(assessment.ux_impact, UxImpact::Moderate);
    }

    #[tokio::test]
    async fn test_denied_assessment_triggers_threat_response() {
        let orchestrator = orchestrator_with(ThreatData::default());
        orchestrator.policy_engine().upsert_policy(Policy {
            id: "lockdown".to_string(),
            name: "Lockdown".to_string(),
            description: String::new(),
            priority: 999,
            enabled: true,
            conditions: Vec::new(),
            decision: PolicyDecision::Deny,
            actions: vec!["terminate_session".to_string()],
            restrictions: Vec::new(),
            risk_adjustment: 0.0,
            challenge_type: None,
            scope: PolicyScope::default(),
        });

        let assessment = orchestrator
            .assess_trust("user-1", &benign_request())
            .await;

        assert_eq!(assessment.decision, PolicyDecision::Deny);
        assert_eq!(assessment.ux_impact, UxImpact::Severe);
        let history = orchestrator.threat_responder().history("user-1");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_clean_sessions_teach_known_locations() {
        let orchestrator = orchestrator_with(ThreatData::default());
        orchestrator
            .assess_trust("user-1", &benign_request())
            .await;

        let history = orchestrator
            .location_histories
            .get("user-1")
            .expect("history recorded");
        assert_eq!(history.known_countries, vec!["DE".to_string()]);
        assert_eq!(history.known_points.len(), 1);
    }

    #[tokio::test]
    async fn test_device_trust_updates_on_each_assessment() {
        let orchestrator = orchestrator_with(ThreatData::default());
        orchestrator
            .assess_trust("user-1", &benign_request())
            .await;
        orchestrator
            .assess_trust("user-1", &benign_request())
            .await;

        let record = orchestrator
            .update_device_trust("user-1", "dev-1", &DeviceActivity {
                fingerprint: "fp-abc".to_string(),
                ..Default::default()
            });
        assert_eq!(record.usage_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_stops_at_max_duration() {
        let orchestrator = orchestrator_with(ThreatData::default());
        orchestrator
            .start_continuous_monitoring("user-1", benign_request())
            .unwrap();
        assert_eq!(orchestrator.active_monitor_count(), 1);

        // Paused tokio time auto-advances; sleep far past the 3s cutoff
        tokio::time::sleep(StdDuration::from_secs(10)).await;

        let summary = orchestrator
            .stop_continuous_monitoring("sess-1")
            .await
            .expect("summary returned");
        assert_eq!(summary.stop_reason, MonitorStop::MaxDurationReached);
        assert_eq!(summary.assessments, 3);
        assert_eq!(orchestrator.active_monitor_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_stop_before_cutoff() {
        let orchestrator = orchestrator_with(ThreatData::default());
        orchestrator
            .start_continuous_monitoring("user-1", benign_request())
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        let summary = orchestrator
            .stop_continuous_monitoring("sess-1")
            .await
            .expect("summary returned");
        assert_eq!(summary.stop_reason, MonitorStop::Stopped);
        assert_eq!(summary.assessments, 1);
    }

    #[tokio::test]
    async fn test_duplicate_monitor_rejected() {
        let orchestrator = orchestrator_with(ThreatData::default());
        orchestrator
            .start_continuous_monitoring("user-1", benign_request())
            .unwrap();
        let second = orchestrator.start_continuous_monitoring("user-1", benign_request());
        assert!(matches!(
            second,
            Err(OrchestratorError::AlreadyMonitoring(_))
        ));
        orchestrator.stop_continuous_monitoring("sess-1").await;
    }

    #[tokio::test]
    async fn test_stop_unknown_session_returns_none() {
        let orchestrator = orchestrator_with(ThreatData::default());
        assert!(orchestrator
            .stop_continuous_monitoring("never-started")
            .await
            .is_none());
    }
}
