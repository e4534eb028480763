// Veritas Trust Engine: Location Intelligence
// Resolves a network address to geographic and threat-reputation data,
// caches lookups, and flags anomalous distance from a user's known
// locations. Provider failures never propagate: resolution degrades to a
// conservative medium-risk, low-confidence profile.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::models::{clamp01, GeoPoint, RiskLevel};
use crate::storage::TtlCache;
use crate::utils::metrics::record_degraded_lookup;

// Distance beyond which an access is anomalous relative to known locations
const ANOMALY_DISTANCE_KM: f64 = 1000.0;
const ANOMALY_CONFIDENCE_CAP: f64 = 0.95;

const BASE_RISK: f64 = 0.1;
const KNOWN_THREAT_RISK: f64 = 0.40;
const TOR_RISK: f64 = 0.35;
const VPN_PROXY_RISK: f64 = 0.25;
const HIGH_RISK_COUNTRY_RISK: f64 = 0.20;
const HOSTING_RISK: f64 = 0.15;
const ABUSE_REPORT_RISK: f64 = 0.03;
const ABUSE_REPORT_RISK_CAP: f64 = 0.15;
// Multiplicative discount when the country is already known for the user
const KNOWN_COUNTRY_DISCOUNT: f64 = 0.6;

const HIGH_RISK_COUNTRIES: &[&str] = &["KP", "IR", "SY", "CU"];

///////////////////////////////////////////////////////////////////////////////
// Provider interfaces
///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("Geolocation provider unreachable: {0}")]
    GeoUnreachable(String),

    #[error("Threat intelligence provider unreachable: {0}")]
    IntelUnreachable(String),

    #[error("Provider rejected the lookup: {0}")]
    Rejected(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeoData {
    pub country: String,
    pub country_code: String,
    pub region: Option<String>,
    pub city: Option<String>,
    pub point: Option<GeoPoint>,
    pub isp: Option<String>,
    pub asn: Option<u32>,
}

impl GeoData {
    fn unknown() -> Self {
        GeoData {
            country: "Unknown".to_string(),
            country_code: "ZZ".to_string(),
            region: None,
            city: None,
            point: None,
            isp: None,
            asn: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThreatData {
    pub is_vpn: bool,
    pub is_proxy: bool,
    pub is_tor: bool,
    pub is_hosting: bool,
    pub known_threat: bool,
    pub abuse_reports: u32,
}

#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<GeoData, LocationError>;
}

#[async_trait]
pub trait ThreatIntelProvider: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<ThreatData, LocationError>;
}

// Default provider used when no geolocation API key is configured. Returns a
// fixed benign profile so the pipeline keeps working in development; it is
// deterministic, never random.
pub struct StaticGeoProvider {
    default: GeoData,
}

impl StaticGeoProvider {
    pub fn new() -> Self {
        StaticGeoProvider {
            default: GeoData {
                country: "United States".to_string(),
                country_code: "US".to_string(),
                region: None,
                city: None,
                point: None,
                isp: Some("unknown".to_string()),
                asn: None,
            },
        }
    }
}

impl Default for StaticGeoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoProvider for StaticGeoProvider {
    async fn lookup(&self, _ip: &str) -> Result<GeoData, LocationError> {
        Ok(self.default.clone())
    }
}

// Default threat-intel provider for keyless environments: everything benign
pub struct StaticThreatIntelProvider;

#[async_trait]
impl ThreatIntelProvider for StaticThreatIntelProvider {
    async fn lookup(&self, _ip: &str) -> Result<ThreatData, LocationError> {
        Ok(ThreatData::default())
    }
}

///////////////////////////////////////////////////////////////////////////////
// Profiles and results
///////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationProfile {
    pub ip: String,
    pub geo: GeoData,
    pub threat: ThreatData,
    pub is_private: bool,
    // True when a provider failed and defaults were substituted
    pub degraded: bool,
    pub confidence: f64,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserLocationHistory {
    pub known_countries: Vec<String>,
    pub known_points: Vec<GeoPoint>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationRisk {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub factors: Vec<String>,
    pub trust_modifier: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationAnomaly {
    pub is_anomalous: bool,
    pub confidence: f64,
    pub nearest_known_km: Option<f64>,
}

///////////////////////////////////////////////////////////////////////////////
// Service
///////////////////////////////////////////////////////////////////////////////

pub struct LocationIntelligence {
    geo: Arc<dyn GeoProvider>,
    intel: Arc<dyn ThreatIntelProvider>,
    geo_cache: TtlCache<GeoData>,
    threat_cache: TtlCache<ThreatData>,
    clock: SharedClock,
}

impl LocationIntelligence {
    pub fn new(
        config: &EngineConfig,
        geo: Arc<dyn GeoProvider>,
        intel: Arc<dyn ThreatIntelProvider>,
        clock: SharedClock,
    ) -> Self {
        LocationIntelligence {
            geo,
            intel,
            geo_cache: TtlCache::new(Duration::seconds(config.geo_cache_ttl_secs)),
            threat_cache: TtlCache::new(Duration::seconds(config.threat_cache_ttl_secs)),
            clock,
        }
    }

    /// Resolve an address to a location profile. Cached (geo 1h, intel 30min);
    /// private and loopback addresses short-circuit to a fixed low-risk profile.
    pub async fn resolve(&self, ip: &str) -> LocationProfile {
        let now = self.clock.now();

        if is_private_address(ip) {
            return LocationProfile {
                ip: ip.to_string(),
                geo: GeoData {
                    country: "Private network".to_string(),
                    country_code: "--".to_string(),
                    region: None,
                    city: None,
                    point: None,
                    isp: Some("internal".to_string()),
                    asn: None,
                },
                threat: ThreatData::default(),
                is_private: true,
                degraded: false,
                confidence: 0.9,
                resolved_at: now,
            };
        }

        let mut degraded = false;

        let geo = match self.geo_cache.get(ip, now) {
            Some(cached) => cached,
            None => match self.geo.lookup(ip).await {
                Ok(data) => {
                    self.geo_cache.put(ip, data.clone(), now);
                    data
                }
                Err(e) => {
                    warn!("geo lookup failed for {}: {}", ip, e);
                    record_degraded_lookup("geolocation");
                    degraded = true;
                    GeoData::unknown()
                }
            },
        };

        let threat = match self.threat_cache.get(ip, now) {
            Some(cached) => cached,
            None => match self.intel.lookup(ip).await {
                Ok(data) => {
                    self.threat_cache.put(ip, data.clone(), now);
                    data
                }
                Err(e) => {
                    warn!("threat intel lookup failed for {}: {}", ip, e);
                    record_degraded_lookup("threat_intel");
                    degraded = true;
                    ThreatData::default()
                }
            },
        };

        LocationProfile {
            ip: ip.to_string(),
            geo,
            threat,
            is_private: false,
            degraded,
            confidence: if degraded { 0.2 } else { 0.8 },
            resolved_at: now,
        }
    }

    /// Score the risk of an access from this address given the user's history
    pub async fn assess_risk(&self, ip: &str, history: &UserLocationHistory) -> LocationRisk {
        let profile = self.resolve(ip).await;

        if profile.is_private {
            return LocationRisk {
                risk_score: 0.05,
                risk_level: RiskLevel::Low,
                factors: Vec::new(),
                trust_modifier: 0.1,
            };
        }

        // Conservative stance when providers were unavailable
        if profile.degraded {
            return LocationRisk {
                risk_score: 0.5,
                risk_level: RiskLevel::Medium,
                factors: vec!["Location intelligence unavailable".to_string()],
                trust_modifier: 0.0,
            };
        }

        let mut score = BASE_RISK;
        let mut factors = Vec::new();

        if profile.threat.known_threat {
            score += KNOWN_THREAT_RISK;
            factors.push("Known threat match".to_string());
        }
        if profile.threat.is_tor {
            score += TOR_RISK;
            factors.push("Tor exit node".to_string());
        }
        if profile.threat.is_vpn || profile.threat.is_proxy {
            score += VPN_PROXY_RISK;
            factors.push("VPN or proxy detected".to_string());
        }
        if HIGH_RISK_COUNTRIES.contains(&profile.geo.country_code.as_str()) {
            score += HIGH_RISK_COUNTRY_RISK;
            factors.push(format!("High-risk country: {}", profile.geo.country_code));
        }
        if profile.threat.is_hosting {
            score += HOSTING_RISK;
            factors.push("Data-center origin".to_string());
        }
        if profile.threat.abuse_reports > 0 {
            score += (profile.threat.abuse_reports as f64 * ABUSE_REPORT_RISK)
                .min(ABUSE_REPORT_RISK_CAP);
            factors.push(format!(
                "{} prior abuse reports",
                profile.threat.abuse_reports
            ));
        }

        let country_known = history
            .known_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&profile.geo.country_code));
        if country_known {
            score *= KNOWN_COUNTRY_DISCOUNT;
        }

        let score = clamp01(score);
        let trust_modifier = if country_known && score < 0.3 {
            0.1
        } else if score > 0.6 {
            -0.2
        } else {
            0.0
        };

        LocationRisk {
            risk_score: score,
            risk_level: RiskLevel::from_score(score),
            factors,
            trust_modifier,
        }
    }

    /// Flag accesses far from every location the user is known to use
    pub async fn detect_anomaly(&self, ip: &str, history: &UserLocationHistory) -> LocationAnomaly {
        let profile = self.resolve(ip).await;

        let Some(point) = profile.geo.point else {
            return LocationAnomaly {
                is_anomalous: false,
                confidence: 0.1,
                nearest_known_km: None,
            };
        };

        if history.known_points.is_empty() {
            return LocationAnomaly {
                is_anomalous: false,
                confidence: 0.2,
                nearest_known_km: None,
            };
        }

        let nearest = history
            .known_points
            .iter()
            .map(|known| known.distance_km(&point))
            .fold(f64::INFINITY, f64::min);

        if nearest > ANOMALY_DISTANCE_KM {
            // Confidence scales with distance, capped
            let confidence = (0.5 + nearest / 10_000.0).min(ANOMALY_CONFIDENCE_CAP);
            LocationAnomaly {
                is_anomalous: true,
                confidence,
                nearest_known_km: Some(nearest),
            }
        } else {
            LocationAnomaly {
                is_anomalous: false,
                confidence: 0.8,
                nearest_known_km: Some(nearest),
            }
        }
    }

    /// Background eviction pass over both caches
    pub fn sweep_caches(&self) -> usize {
        let now = self.clock.now();
        self.geo_cache.sweep(now) + self.threat_cache.sweep(now)
    }
}

// Private, loopback, and link-local addresses never leave the building, so
// they short-circuit resolution. Unparsable input is treated as public and
// left to the providers.
fn is_private_address(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique local fc00::/7
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct ScriptedGeoProvider {
        data: GeoData,
        calls: Mutex<u32>,
        failing: bool,
    }

    impl ScriptedGeoProvider {
        fn returning(data: GeoData) -> Self {
            ScriptedGeoProvider {
                data,
                calls: Mutex::new(0),
                failing: false,
            }
        }

        fn failing() -> Self {
            ScriptedGeoProvider {
                data: GeoData::unknown(),
                calls: Mutex::new(0),
                failing: true,
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl GeoProvider for ScriptedGeoProvider {
        async fn lookup(&self, _ip: &str) -> Result<GeoData, LocationError> {
            *self.calls.lock() += 1;
            if self.failing {
                Err(LocationError::GeoUnreachable("scripted outage".into()))
            } else {
                Ok(self.data.clone())
            }
        }
    }

    struct ScriptedThreatProvider {
        data: ThreatData,
    }

    #[async_trait]
    impl ThreatIntelProvider for ScriptedThreatProvider {
        async fn lookup(&self, _ip: &str) -> Result<ThreatData, LocationError> {
            Ok(self.data.clone())
        }
    }

    fn berlin_geo() -> GeoData {
        GeoData {
            country: "Germany".to_string(),
            country_code: "DE".to_string(),
            region: Some("Berlin".to_string()),
            city: Some("Berlin".to_string()),
            point: Some(GeoPoint::new(52.52, 13.405)),
            isp: Some("Example ISP".to_string()),
            asn: Some(3320),
        }
    }

    fn service(
        geo: Arc<dyn GeoProvider>,
        threat: ThreatData,
    ) -> (LocationIntelligence, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let config = EngineConfig::default();
        let svc = LocationIntelligence::new(
            &config,
            geo,
            Arc::new(ScriptedThreatProvider { data: threat }),
            clock.clone(),
        );
        (svc, clock)
    }

    #[tokio::test]
    async fn test_private_address_short_circuits() {
        for ip in ["10.1.2.3", "192.168.0.10", "127.0.0.1", "::1", "fd00::1"] {
            let geo = Arc::new(ScriptedGeoProvider::failing());
            let (svc, _) = service(geo.clone(), ThreatData::default());

            let risk = svc.assess_risk(ip, &UserLocationHistory::default()).await;
            assert_eq!(risk.risk_level, RiskLevel::Low, "ip {}", ip);
            assert!(risk.factors.is_empty(), "ip {}", ip);
            // No provider call for private space
            assert_eq!(geo.calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_resolution_is_cached() {
        let geo = Arc::new(ScriptedGeoProvider::returning(berlin_geo()));
        let (svc, clock) = service(geo.clone(), ThreatData::default());

        svc.resolve("203.0.113.7").await;
        svc.resolve("203.0.113.7").await;
        assert_eq!(geo.calls(), 1);

        // Past the geo TTL the provider is consulted again
        clock.advance(Duration::seconds(3601));
        svc.resolve("203.0.113.7").await;
        assert_eq!(geo.calls(), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_conservatively() {
        let geo = Arc::new(ScriptedGeoProvider::failing());
        let (svc, _) = service(geo, ThreatData::default());

        let profile = svc.resolve("203.0.113.7").await;
        assert!(profile.degraded);
        assert!(profile.confidence <= 0.2);

        let risk = svc
            .assess_risk("203.0.113.7", &UserLocationHistory::default())
            .await;
        assert_eq!(risk.risk_level, RiskLevel::Medium);
        assert!((risk.risk_score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_threat_factors_accumulate() {
        let geo = Arc::new(ScriptedGeoProvider::returning(berlin_geo()));
        let threat = ThreatData {
            is_vpn: true,
            is_tor: true,
            is_hosting: true,
            abuse_reports: 4,
            ..Default::default()
        };
        let (svc, _) = service(geo, threat);

        let risk = svc
            .assess_risk("203.0.113.7", &UserLocationHistory::default())
            .await;
        assert!(risk.risk_score > 0.7);
        assert!(risk.risk_score <= 1.0);
        assert!(risk.factors.iter().any(|f| f.contains("Tor")));
        assert!(risk.factors.iter().any(|f| f.contains("VPN")));
        assert!(risk.trust_modifier < 0.0);
    }

    #[tokio::test]
    async fn test_known_country_discount() {
        let geo = Arc::new(ScriptedGeoProvider::returning(berlin_geo()));
        let threat = ThreatData {
            is_vpn: true,
            ..Default::default()
        };
        let (svc, _) = service(geo, threat);

        let stranger = svc
            .assess_risk("203.0.113.7", &UserLocationHistory::default())
            .await;
        let local = svc
            .assess_risk(
                "203.0.113.7",
                &UserLocationHistory {
                    known_countries: vec!["DE".to_string()],
                    known_points: Vec::new(),
                },
            )
            .await;
        assert!(local.risk_score < stranger.risk_score);
    }

    #[tokio::test]
    async fn test_distant_access_is_anomalous() {
        // Scenario: access from Berlin while every known point is near Sydney
        let geo = Arc::new(ScriptedGeoProvider::returning(berlin_geo()));
        let (svc, _) = service(geo, ThreatData::default());

        let history = UserLocationHistory {
            known_countries: vec!["AU".to_string()],
            known_points: vec![GeoPoint::new(-33.8688, 151.2093)],
        };
        let anomaly = svc.detect_anomaly("203.0.113.7", &history).await;
        assert!(anomaly.is_anomalous);
        assert!(anomaly.nearest_known_km.unwrap() > 10_000.0);
        assert!((anomaly.confidence - ANOMALY_CONFIDENCE_CAP).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_nearby_access_is_not_anomalous() {
        let geo = Arc::new(ScriptedGeoProvider::returning(berlin_geo()));
        let (svc, _) = service(geo, ThreatData::default());

        let history = UserLocationHistory {
            known_countries: vec!["DE".to_string()],
            // Potsdam, a short hop from Berlin
            known_points: vec![GeoPoint::new(52.3906, 13.0645)],
        };
        let anomaly = svc.detect_anomaly("203.0.113.7", &history).await;
        assert!(!anomaly.is_anomalous);
        assert!(anomaly.nearest_known_km.unwrap() < 100.0);
    }

    #[tokio::test]
    async fn test_anomaly_confidence_scales_with_distance() {
        let geo = Arc::new(ScriptedGeoProvider::returning(berlin_geo()));
        let (svc, _) = service(geo, ThreatData::default());

        // Madrid is ~1870 km from Berlin: anomalous but not at the cap
        let history = UserLocationHistory {
            known_countries: vec!["ES".to_string()],
            known_points: vec![GeoPoint::new(40.4168, -3.7038)],
        };
        let anomaly = svc.detect_anomaly("203.0.113.7", &history).await;
        assert!(anomaly.is_anomalous);
        assert!(anomaly.confidence > 0.5);
        assert!(anomaly.confidence < ANOMALY_CONFIDENCE_CAP);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_entries() {
        let geo = Arc::new(ScriptedGeoProvider::returning(berlin_geo()));
        let (svc, clock) = service(geo, ThreatData::default());

        svc.resolve("203.0.113.7").await;
        clock.advance(Duration::seconds(7200));
        assert!(svc.sweep_caches() >= 2);
    }
}
