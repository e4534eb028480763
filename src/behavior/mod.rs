// Veritas Trust Engine: Behavior Analysis Service
// Compares per-session behavior metrics against a user's learned baseline and
// emits an anomaly verdict. With no baseline yet the user is in the learning
// phase: nothing is anomalous, confidence is low, and the recommendation is
// to keep building the profile.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::api::BehaviorPersistence;
use crate::clock::SharedClock;
use crate::models::RiskLevel;
use crate::telemetry::BehaviorMetrics;
use crate::utils::metrics::record_degraded_lookup;

// Deviation thresholds per category
const TYPING_SPEED_DEVIATION: f64 = 0.30; // >30% relative deviation
const KEY_PRESS_DEVIATION_MS: f64 = 50.0; // >50ms absolute deviation
const POINTER_SPEED_DEVIATION: f64 = 0.40;
const POINTER_PRECISION_DEVIATION: f64 = 0.30;
const TIME_ON_PAGE_DEVIATION: f64 = 0.50;

// More than this many anomalous categories marks the session anomalous
const ANOMALY_TOLERANCE: usize = 2;

// Baseline update requires a non-anomalous session with confidence above this
const BASELINE_UPDATE_CONFIDENCE: f64 = 0.7;

// Exponential blend factor when folding a new session into the baseline
const BASELINE_RETAIN: f64 = 0.7;
const BASELINE_ADOPT: f64 = 0.3;

///////////////////////////////////////////////////////////////////////////////
// Baseline
///////////////////////////////////////////////////////////////////////////////

// Per-user learned behavioral profile. Never deleted, only superseded by
// the next update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BehaviorBaseline {
    pub user_id: String,
    pub typing_speed_cpm: f64,
    pub avg_key_press_ms: f64,
    pub pointer_speed_px_s: f64,
    pub pointer_path_straightness: f64,
    pub avg_time_on_page_secs: f64,
    pub active_hours: Vec<u32>,
    pub confidence: f64,
    pub sample_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BehaviorBaseline {
    pub fn empty(user_id: &str, now: DateTime<Utc>) -> Self {
        BehaviorBaseline {
            user_id: user_id.to_string(),
            typing_speed_cpm: 0.0,
            avg_key_press_ms: 0.0,
            pointer_speed_px_s: 0.0,
            pointer_path_straightness: 0.0,
            avg_time_on_page_secs: 0.0,
            active_hours: Vec::new(),
            confidence: 0.0,
            sample_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Seed a first baseline directly from one session's metrics
    pub fn from_metrics(metrics: &BehaviorMetrics, now: DateTime<Utc>) -> Self {
        BehaviorBaseline {
            user_id: metrics.user_id.clone(),
            typing_speed_cpm: metrics.typing_speed_cpm,
            avg_key_press_ms: metrics.avg_key_press_ms,
            pointer_speed_px_s: metrics.pointer_speed_px_s,
            pointer_path_straightness: metrics.pointer_path_straightness,
            avg_time_on_page_secs: metrics.avg_time_on_page_secs,
            active_hours: vec![metrics.access_hour],
            confidence: 0.35,
            sample_count: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a non-anomalous session into the profile
    pub fn absorb(&self, metrics: &BehaviorMetrics, now: DateTime<Utc>) -> Self {
        let blend = |old: f64, new: f64| old * BASELINE_RETAIN + new * BASELINE_ADOPT;

        let mut active_hours = self.active_hours.clone();
        if !active_hours.contains(&metrics.access_hour) {
            active_hours.push(metrics.access_hour);
            active_hours.sort_unstable();
        }

        let sample_count = self.sample_count + 1;
        BehaviorBaseline {
            user_id: self.user_id.clone(),
            typing_speed_cpm: blend(self.typing_speed_cpm, metrics.typing_speed_cpm),
            avg_key_press_ms: blend(self.avg_key_press_ms, metrics.avg_key_press_ms),
            pointer_speed_px_s: blend(self.pointer_speed_px_s, metrics.pointer_speed_px_s),
            pointer_path_straightness: blend(
                self.pointer_path_straightness,
                metrics.pointer_path_straightness,
            ),
            avg_time_on_page_secs: blend(
                self.avg_time_on_page_secs,
                metrics.avg_time_on_page_secs,
            ),
            active_hours,
            confidence: (0.3 + sample_count as f64 * 0.05).min(0.95),
            sample_count,
            created_at: self.created_at,
            updated_at: now,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Analysis result
///////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCategory {
    TypingSpeed,
    KeyPressDuration,
    PointerSpeed,
    PointerPrecision,
    TimeOnPage,
    AccessHour,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BehaviorAnomaly {
    pub category: AnomalyCategory,
    pub deviation: f64,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BehaviorAnalysis {
    pub user_id: String,
    pub session_id: String,
    pub is_anomaly: bool,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub anomalies: Vec<BehaviorAnomaly>,
    pub recommendations: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

///////////////////////////////////////////////////////////////////////////////
// Analyzer
///////////////////////////////////////////////////////////////////////////////

pub struct BehaviorAnalyzer {
    store: Arc<dyn BehaviorPersistence>,
    clock: SharedClock,
}

impl BehaviorAnalyzer {
    pub fn new(store: Arc<dyn BehaviorPersistence>, clock: SharedClock) -> Self {
        BehaviorAnalyzer { store, clock }
    }

    /// Pure comparison of one session's metrics against a baseline
    pub fn analyze(
        &self,
        metrics: &BehaviorMetrics,
        baseline: Option<&BehaviorBaseline>,
    ) -> BehaviorAnalysis {
        let now = self.clock.now();

        let Some(baseline) = baseline.filter(|b| b.sample_count > 0) else {
            return BehaviorAnalysis {
                user_id: metrics.user_id.clone(),
                session_id: metrics.session_id.clone(),
                is_anomaly: false,
                confidence: 0.5,
                risk_level: RiskLevel::Low,
                anomalies: Vec::new(),
                recommendations: vec!["Building behavioral baseline".to_string()],
                analyzed_at: now,
            };
        };

        let anomalies = detect_anomalies(metrics, baseline);
        let is_anomaly = anomalies.len() > ANOMALY_TOLERANCE;
        let confidence = analysis_confidence(metrics, baseline);
        let risk_level = step_risk_level(anomalies.len(), confidence);

        BehaviorAnalysis {
            user_id: metrics.user_id.clone(),
            session_id: metrics.session_id.clone(),
            is_anomaly,
            confidence,
            risk_level,
            anomalies,
            recommendations: recommendations_for(risk_level),
            analyzed_at: now,
        }
    }

    /// Analyze a session and apply the baseline update rule. Returns the
    /// analysis and the baseline that is now current for the user.
    pub async fn observe(
        &self,
        metrics: &BehaviorMetrics,
    ) -> (BehaviorAnalysis, Option<BehaviorBaseline>) {
        let (baseline, fetch_failed) = match self.store.fetch_baseline(&metrics.user_id).await {
            Ok(baseline) => (baseline, false),
            Err(e) => {
                warn!(
                    "baseline fetch failed, analyzing without baseline: user={} reason={}",
                    metrics.user_id, e
                );
                record_degraded_lookup("behavior_baseline");
                (None, true)
            }
        };

        let analysis = self.analyze(metrics, baseline.as_ref());
        let now = self.clock.now();

        let updated = if fetch_failed {
            // A failed read says nothing about whether a profile exists; a
            // first-session write here could overwrite a mature baseline
            None
        } else {
            match &baseline {
                // Created lazily on the user's first session
                None => Some(BehaviorBaseline::from_metrics(metrics, now)),
                Some(current) => {
                    if !analysis.is_anomaly && analysis.confidence > BASELINE_UPDATE_CONFIDENCE {
                        Some(current.absorb(metrics, now))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(next) = &updated {
            debug!(
                "baseline updated: user={} samples={} confidence={:.2}",
                next.user_id, next.sample_count, next.confidence
            );
            if let Err(e) = self.store.store_baseline(next).await {
                warn!(
                    "baseline persist failed: user={} reason={}",
                    next.user_id, e
                );
            }
        }

        let current = updated.or(baseline);
        (analysis, current)
    }
}

fn detect_anomalies(metrics: &BehaviorMetrics, baseline: &BehaviorBaseline) -> Vec<BehaviorAnomaly> {
    let mut anomalies = Vec::new();

    let relative = |observed: f64, expected: f64| -> f64 {
        if expected.abs() < 1e-9 {
            0.0
        } else {
            (observed - expected).abs() / expected
        }
    };

    let typing_dev = relative(metrics.typing_speed_cpm, baseline.typing_speed_cpm);
    if typing_dev > TYPING_SPEED_DEVIATION {
        anomalies.push(BehaviorAnomaly {
            category: AnomalyCategory::TypingSpeed,
            deviation: typing_dev,
            detail: format!(
                "typing speed {:.0} cpm vs baseline {:.0} cpm",
                metrics.typing_speed_cpm, baseline.typing_speed_cpm
            ),
        });
    }

    let press_dev = (metrics.avg_key_press_ms - baseline.avg_key_press_ms).abs();
    if press_dev > KEY_PRESS_DEVIATION_MS {
        anomalies.push(BehaviorAnomaly {
            category: AnomalyCategory::KeyPressDuration,
            deviation: press_dev,
            detail: format!(
                "key press {:.0}ms vs baseline {:.0}ms",
                metrics.avg_key_press_ms, baseline.avg_key_press_ms
            ),
        });
    }

    let pointer_dev = relative(metrics.pointer_speed_px_s, baseline.pointer_speed_px_s);
    if pointer_dev > POINTER_SPEED_DEVIATION {
        anomalies.push(BehaviorAnomaly {
            category: AnomalyCategory::PointerSpeed,
            deviation: pointer_dev,
            detail: format!(
                "pointer speed {:.0} px/s vs baseline {:.0} px/s",
                metrics.pointer_speed_px_s, baseline.pointer_speed_px_s
            ),
        });
    }

    let precision_dev =
        (metrics.pointer_path_straightness - baseline.pointer_path_straightness).abs();
    if precision_dev > POINTER_PRECISION_DEVIATION {
        anomalies.push(BehaviorAnomaly {
            category: AnomalyCategory::PointerPrecision,
            deviation: precision_dev,
            detail: format!(
                "path straightness {:.2} vs baseline {:.2}",
                metrics.pointer_path_straightness, baseline.pointer_path_straightness
            ),
        });
    }

    let page_dev = relative(metrics.avg_time_on_page_secs, baseline.avg_time_on_page_secs);
    if page_dev > TIME_ON_PAGE_DEVIATION {
        anomalies.push(BehaviorAnomaly {
            category: AnomalyCategory::TimeOnPage,
            deviation: page_dev,
            detail: format!(
                "time on page {:.0}s vs baseline {:.0}s",
                metrics.avg_time_on_page_secs, baseline.avg_time_on_page_secs
            ),
        });
    }

    if !baseline.active_hours.is_empty() && !baseline.active_hours.contains(&metrics.access_hour) {
        anomalies.push(BehaviorAnomaly {
            category: AnomalyCategory::AccessHour,
            deviation: 1.0,
            detail: format!("access at hour {} outside active hours", metrics.access_hour),
        });
    }

    anomalies
}

// Confidence in the verdict: grows with baseline maturity and with how much
// data the session itself carried.
fn analysis_confidence(metrics: &BehaviorMetrics, baseline: &BehaviorBaseline) -> f64 {
    let maturity = 0.05 * (baseline.sample_count.min(10) as f64);
    let data_volume = (metrics.event_count as f64 / 400.0).min(0.25);
    (0.45 + maturity + data_volume).min(0.95)
}

// Step function over anomaly count, tempered by confidence
fn step_risk_level(anomaly_count: usize, confidence: f64) -> RiskLevel {
    match anomaly_count {
        0 | 1 => RiskLevel::Low,
        2 => RiskLevel::Medium,
        3 => {
            if confidence > 0.7 {
                RiskLevel::High
            } else {
                RiskLevel::Medium
            }
        }
        _ => {
            if confidence > 0.7 {
                RiskLevel::Critical
            } else {
                RiskLevel::High
            }
        }
    }
}

fn recommendations_for(risk_level: RiskLevel) -> Vec<String> {
    match risk_level {
        RiskLevel::Low => vec!["Continue monitoring".to_string()],
        RiskLevel::Medium => vec![
            "Consider additional verification".to_string(),
            "Monitor session closely".to_string(),
        ],
        RiskLevel::High => vec![
            "Require step-up verification".to_string(),
            "Limit session duration".to_string(),
        ],
        RiskLevel::Critical => vec![
            "Restrict session".to_string(),
            "Escalate for review".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InMemoryBehaviorStore;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn metrics(user: &str) -> BehaviorMetrics {
        BehaviorMetrics {
            session_id: "s1".to_string(),
            user_id: user.to_string(),
            device_id: "d1".to_string(),
            captured_at: Utc::now(),
            session_duration_secs: 600,
            typing_speed_cpm: 200.0,
            avg_key_press_ms: 90.0,
            typing_rhythm_variance: 1200.0,
            pointer_speed_px_s: 800.0,
            pointer_path_straightness: 0.6,
            avg_time_on_page_secs: 45.0,
            navigation_count: 8,
            focus_changes: 4,
            access_hour: 10,
            event_count: 300,
        }
    }

    fn mature_baseline(user: &str) -> BehaviorBaseline {
        BehaviorBaseline {
            user_id: user.to_string(),
            typing_speed_cpm: 200.0,
            avg_key_press_ms: 90.0,
            pointer_speed_px_s: 800.0,
            pointer_path_straightness: 0.6,
            avg_time_on_page_secs: 45.0,
            active_hours: vec![9, 10, 11, 14, 15],
            confidence: 0.8,
            sample_count: 12,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn analyzer() -> (BehaviorAnalyzer, Arc<InMemoryBehaviorStore>) {
        let store = Arc::new(InMemoryBehaviorStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap(),
        ));
        (BehaviorAnalyzer::new(store.clone(), clock), store)
    }

    #[test]
    fn test_no_baseline_is_learning_phase() {
        // Scenario: new user, normal metrics, nothing learned yet
        let (analyzer, _) = analyzer();
        let analysis = analyzer.analyze(&metrics("u1"), None);

        assert!(!analysis.is_anomaly);
        assert!((analysis.confidence - 0.5).abs() < 1e-9);
        assert_eq!(analysis.risk_level, RiskLevel::Low);
        assert!(analysis.recommendations[0].contains("baseline"));
    }

    #[test]
    fn test_matching_session_has_no_anomalies() {
        let (analyzer, _) = analyzer();
        let analysis = analyzer.analyze(&metrics("u1"), Some(&mature_baseline("u1")));

        assert!(!analysis.is_anomaly);
        assert!(analysis.anomalies.is_empty());
        assert_eq!(analysis.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_deviant_session_flagged() {
        let (analyzer, _) = analyzer();
        let mut m = metrics("u1");
        m.typing_speed_cpm = 320.0; // +60%
        m.avg_key_press_ms = 160.0; // +70ms
        m.pointer_speed_px_s = 1400.0; // +75%
        m.access_hour = 3; // outside active hours

        let analysis = analyzer.analyze(&m, Some(&mature_baseline("u1")));
        assert!(analysis.anomalies.len() > ANOMALY_TOLERANCE);
        assert!(analysis.is_anomaly);
        assert!(analysis.risk_level >= RiskLevel::High);
    }

    #[test]
    fn test_two_anomalies_tolerated() {
        let (analyzer, _) = analyzer();
        let mut m = metrics("u1");
        m.typing_speed_cpm = 320.0;
        m.access_hour = 3;

        let analysis = analyzer.analyze(&m, Some(&mature_baseline("u1")));
        assert_eq!(analysis.anomalies.len(), 2);
        assert!(!analysis.is_anomaly);
        assert_eq!(analysis.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn test_first_session_creates_baseline() {
        let (analyzer, store) = analyzer();
        let (analysis, baseline) = analyzer.observe(&metrics("u1")).await;

        assert!(!analysis.is_anomaly);
        let baseline = baseline.expect("baseline created lazily");
        assert_eq!(baseline.sample_count, 1);
        assert!(store.baseline("u1").is_some());
    }

    #[tokio::test]
    async fn test_anomalous_session_does_not_update_baseline() {
        let (analyzer, store) = analyzer();
        store.seed_baseline(mature_baseline("u1"));

        let mut m = metrics("u1");
        m.typing_speed_cpm = 500.0;
        m.avg_key_press_ms = 200.0;
        m.pointer_speed_px_s = 2500.0;
        m.access_hour = 3;

        let (analysis, _) = analyzer.observe(&m).await;
        assert!(analysis.is_anomaly);
        assert_eq!(store.baseline("u1").unwrap().sample_count, 12);
    }

    #[tokio::test]
    async fn test_clean_session_updates_baseline() {
        let (analyzer, store) = analyzer();
        store.seed_baseline(mature_baseline("u1"));

        let (analysis, _) = analyzer.observe(&metrics("u1")).await;
        assert!(!analysis.is_anomaly);
        assert!(analysis.confidence > BASELINE_UPDATE_CONFIDENCE);
        assert_eq!(store.baseline("u1").unwrap().sample_count, 13);
    }

    #[tokio::test]
    async fn test_fetch_failure_degrades_to_learning() {
        let (analyzer, store) = analyzer();
        store.seed_baseline(mature_baseline("u1"));
        store.fail_next_writes(1); // fail the fetch

        let (analysis, _) = analyzer.observe(&metrics("u1")).await;
        assert!(!analysis.is_anomaly);
        assert!((analysis.confidence - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fetch_failure_never_overwrites_stored_baseline() {
        let (analyzer, store) = analyzer();
        let seeded = mature_baseline("u1");
        let seeded_samples = seeded.sample_count;
        store.seed_baseline(seeded);
        store.fail_next_writes(1); // fail the fetch

        analyzer.observe(&metrics("u1")).await;

        // The unreachable profile must survive the degraded pass untouched;
        // only a confirmed-absent baseline gets the first-session write
        let stored = store.baseline("u1").expect("baseline still present");
        assert_eq!(stored.sample_count, seeded_samples);
    }

    #[test]
    fn test_absorb_blends_and_extends_hours() {
        let baseline = mature_baseline("u1");
        let mut m = metrics("u1");
        m.typing_speed_cpm = 300.0;
        m.access_hour = 20;

        let next = baseline.absorb(&m, Utc::now());
        assert!((next.typing_speed_cpm - (200.0 * 0.7 + 300.0 * 0.3)).abs() < 1e-9);
        assert!(next.active_hours.contains(&20));
        assert_eq!(next.sample_count, 13);
    }
}
