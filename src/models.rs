// Veritas Trust Engine: Shared Risk Model Types
// Vocabulary types used across the assessment pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Discretized risk bucket derived from an overall risk score
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    // Thresholds: low < 0.3, medium < 0.5, high < 0.85, critical >= 0.85.
    // Scores between the high and critical cut-points map to High.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            RiskLevel::Critical
        } else if score >= 0.5 {
            RiskLevel::High
        } else if score >= 0.3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

// Action the risk aggregator recommends to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    None,
    Monitor,
    Challenge,
    Restrict,
    Block,
}

// Authorization decision produced by the policy engine.
// Ordering is the restrictiveness precedence: deny > restrict > challenge > allow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    Allow,
    Challenge,
    Restrict,
    Deny,
}

// Device trust lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Learning,
    Trusted,
    Suspicious,
    Blocked,
}

// Severity attached to a threat event
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatSeverity {
    pub fn escalation_level(&self) -> u8 {
        match self {
            ThreatSeverity::Low => 0,
            ThreatSeverity::Medium => 1,
            ThreatSeverity::High => 2,
            ThreatSeverity::Critical => 3,
        }
    }
}

// Step-up challenge variants the policy engine can require
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    Totp,
    Sms,
    Email,
    Webauthn,
}

// Geographic coordinate pair
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoPoint { latitude, longitude }
    }

    // Great-circle distance in kilometers (haversine)
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }
}

// Identity carried by every record the pipeline produces
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestIdentity {
    pub user_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

// Clamp a value into the [0, 1] range
pub fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_thresholds() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.29), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.3), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.49), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.5), RiskLevel::High);
        // Scores between the high and critical cut-points stay High
        assert_eq!(RiskLevel::from_score(0.7), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.84), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.85), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(1.0), RiskLevel::Critical);
    }

    #[test]
    fn test_decision_precedence() {
        assert!(PolicyDecision::Deny > PolicyDecision::Restrict);
        assert!(PolicyDecision::Restrict > PolicyDecision::Challenge);
        assert!(PolicyDecision::Challenge > PolicyDecision::Allow);
    }

    #[test]
    fn test_haversine_known_distance() {
        // London to Paris is roughly 344 km
        let london = GeoPoint::new(51.5074, -0.1278);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let distance = london.distance_km(&paris);
        assert!((distance - 344.0).abs() < 10.0, "got {}", distance);
    }

    #[test]
    fn test_haversine_zero_distance() {
        let p = GeoPoint::new(40.7128, -74.0060);
        assert!(p.distance_km(&p) < 1e-9);
    }

    #[test]
    fn test_escalation_levels() {
        assert_eq!(ThreatSeverity::Low.escalation_level(), 0);
        assert_eq!(ThreatSeverity::Critical.escalation_level(), 3);
    }

    #[test]
    fn test_clamp01() {
        assert_eq!(clamp01(-0.5), 0.0);
        assert_eq!(clamp01(0.5), 0.5);
        assert_eq!(clamp01(1.7), 1.0);
    }
}
