// Metric helpers built on the `metrics` facade. The embedding application
// installs an exporter (Prometheus or otherwise); with no recorder installed
// every call is a no-op, so the pipeline can record unconditionally.

use crate::models::RiskLevel;

/// Record a completed trust assessment
pub fn record_assessment(risk_level: RiskLevel, duration_secs: f64) {
    metrics::increment_counter!(
        "trust_assessments_total",
        "risk_level" => risk_level.as_str()
    );
    metrics::histogram!("trust_assessment_duration_seconds", duration_secs);
}

/// Record a policy evaluation and whether it was served from cache
pub fn record_policy_evaluation(decision: &str, cached: bool) {
    metrics::increment_counter!(
        "policy_evaluations_total",
        "decision" => decision.to_string(),
        "cached" => if cached { "true" } else { "false" }
    );
}

/// Record a threat response by strategy
pub fn record_threat_response(strategy: &str, action_count: usize) {
    metrics::increment_counter!(
        "threat_responses_total",
        "strategy" => strategy.to_string()
    );
    metrics::histogram!("threat_response_actions", action_count as f64);
}

/// Record a degraded external lookup (geo, threat intel, behavior API)
pub fn record_degraded_lookup(dependency: &str) {
    metrics::increment_counter!(
        "degraded_lookups_total",
        "dependency" => dependency.to_string()
    );
}

/// Record the current number of active continuous-monitoring sessions
pub fn set_active_monitors(count: usize) {
    metrics::gauge!("active_monitoring_sessions", count as f64);
}
