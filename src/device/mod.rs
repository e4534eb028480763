// Veritas Trust Engine: Device Trust Store
// One trust record per device fingerprint per user. Trust evolves from an
// initial learning value toward trusted, suspicious, or blocked as
// verifications accumulate. The live score never jumps to the candidate
// produced by a single verification: it moves by a bounded step, so one
// anomalous sighting cannot swing a device across the state machine.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::models::{clamp01, TrustStatus};
use crate::storage::KeyValueStore;

// Verification check weights (sum to 1.0)
const WEIGHT_FINGERPRINT: f64 = 0.30;
const WEIGHT_BEHAVIOR: f64 = 0.25;
const WEIGHT_LOCATION: f64 = 0.25;
const WEIGHT_TEMPORAL: f64 = 0.20;

// Status thresholds
const BLOCKED_CEILING: f64 = 0.2;
const SUSPICIOUS_CEILING: f64 = 0.4;
const TRUSTED_FLOOR: f64 = 0.8;
// Below this, an expired learning window extends instead of defaulting to trusted
const EXPIRY_TRUST_FLOOR: f64 = 0.5;

const INITIAL_TRUST: f64 = 0.5;

// Bounded smoothing step: larger while the device is new, smaller once
// usage has accumulated
const STEP_WHILE_NEW: f64 = 0.15;
const STEP_ESTABLISHED: f64 = 0.05;
const NEW_DEVICE_USAGE: u32 = 10;

const USAGE_BONUS_PER_SIGHTING: f64 = 0.005;
const USAGE_BONUS_CAP: f64 = 0.10;
const ANOMALY_PENALTY_PER_EVENT: f64 = 0.05;
const ANOMALY_PENALTY_CAP: f64 = 0.20;

///////////////////////////////////////////////////////////////////////////////
// Records
///////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    FingerprintConsistency,
    BehaviorConsistency,
    LocationConsistency,
    TemporalPattern,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Suspicious,
    Fail,
}

impl Verdict {
    fn value(&self) -> f64 {
        match self {
            Verdict::Pass => 1.0,
            Verdict::Suspicious => 0.5,
            Verdict::Fail => 0.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub verdict: Verdict,
    pub confidence: f64,
}

impl CheckResult {
    // Contribution in [0,1]; low confidence pulls toward the neutral 0.5
    fn effective(&self) -> f64 {
        self.verdict.value() * self.confidence + 0.5 * (1.0 - self.confidence)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub at: DateTime<Utc>,
    pub candidate_score: f64,
    pub applied_score: f64,
    pub checks: Vec<CheckResult>,
    pub anomalous: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub user_id: String,
    pub fingerprint_hash: String,
    pub trust_score: f64,
    // Derived by the state machine, never set directly
    pub status: TrustStatus,
    pub learning_started: DateTime<Utc>,
    pub learning_expires: DateTime<Utc>,
    pub usage_count: u32,
    pub anomaly_count: u32,
    pub verification_history: VecDeque<VerificationOutcome>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// Facts about the current sighting, gathered by the orchestrator from the
// behavior and location services
#[derive(Clone, Debug, Default)]
pub struct DeviceActivity {
    pub fingerprint: String,
    pub behavior_anomalous: Option<bool>,
    pub behavior_confidence: f64,
    pub location_known: Option<bool>,
    pub location_confidence: f64,
    pub hour_typical: Option<bool>,
}

pub fn fingerprint_hash(fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

///////////////////////////////////////////////////////////////////////////////
// Store
///////////////////////////////////////////////////////////////////////////////

pub struct DeviceTrustStore {
    records: Arc<dyn KeyValueStore<DeviceRecord>>,
    clock: SharedClock,
    learning_period: Duration,
    learning_extension: Duration,
    history_limit: usize,
}

impl DeviceTrustStore {
    pub fn new(
        config: &EngineConfig,
        records: Arc<dyn KeyValueStore<DeviceRecord>>,
        clock: SharedClock,
    ) -> Self {
        DeviceTrustStore {
            records,
            clock,
            learning_period: Duration::days(config.learning_period_days),
            learning_extension: Duration::days(config.learning_extension_days),
            history_limit: config.verification_history_limit,
        }
    }

    pub fn get(&self, user_id: &str, device_id: &str) -> Option<DeviceRecord> {
        self.records.get(&record_key(user_id, device_id))
    }

    /// Apply one sighting to the device record, creating it on first sight.
    /// Returns the record after the score update and status transition.
    pub fn update(&self, user_id: &str, device_id: &str, activity: &DeviceActivity) -> DeviceRecord {
        let now = self.clock.now();
        let key = record_key(user_id, device_id);

        let updated = self.records.update(&key, &mut |current| {
            let mut record = current.unwrap_or_else(|| {
                info!(
                    "new device sighted: user={} device={}, entering learning period",
                    user_id, device_id
                );
                DeviceRecord {
                    device_id: device_id.to_string(),
                    user_id: user_id.to_string(),
                    fingerprint_hash: fingerprint_hash(&activity.fingerprint),
                    trust_score: INITIAL_TRUST,
                    status: TrustStatus::Learning,
                    learning_started: now,
                    learning_expires: now + self.learning_period,
                    usage_count: 0,
                    anomaly_count: 0,
                    verification_history: VecDeque::new(),
                    first_seen: now,
                    last_seen: now,
                }
            });

            let checks = run_checks(&record, activity);
            let anomalous = checks.iter().any(|c| c.verdict == Verdict::Fail)
                || activity.behavior_anomalous == Some(true);
            if anomalous {
                record.anomaly_count += 1;
            }

            let candidate = candidate_score(&record, &checks);
            let applied = smooth(record.trust_score, candidate, record.usage_count);

            record.verification_history.push_back(VerificationOutcome {
                at: now,
                candidate_score: candidate,
                applied_score: applied,
                checks,
                anomalous,
            });
            while record.verification_history.len() > self.history_limit {
                record.verification_history.pop_front();
            }

            record.trust_score = applied;
            record.usage_count += 1;
            record.last_seen = now;

            self.transition(&mut record, now);

            debug!(
                "device trust updated: user={} device={} candidate={:.3} score={:.3} status={:?}",
                user_id, device_id, candidate, applied, record.status
            );
            Some(record)
        });

        // update() always returns Some because the closure always produces a record
        updated.unwrap_or_else(|| unreachable!("device update closure always yields a record"))
    }

    // The only place a status is assigned
    fn transition(&self, record: &mut DeviceRecord, now: DateTime<Utc>) {
        let (status, extend) = resolve_status(record.trust_score, now, record.learning_expires);
        if extend {
            record.learning_expires = now + self.learning_extension;
            info!(
                "learning period extended: user={} device={} score={:.3}",
                record.user_id, record.device_id, record.trust_score
            );
        }
        record.status = status;
    }
}

// State machine rule, evaluated on every update. Returns the next status and
// whether the learning window must be extended.
fn resolve_status(
    score: f64,
    now: DateTime<Utc>,
    learning_expires: DateTime<Utc>,
) -> (TrustStatus, bool) {
    if score <= BLOCKED_CEILING {
        (TrustStatus::Blocked, false)
    } else if score < SUSPICIOUS_CEILING {
        (TrustStatus::Suspicious, false)
    } else if score >= TRUSTED_FLOOR {
        (TrustStatus::Trusted, false)
    } else if now <= learning_expires {
        (TrustStatus::Learning, false)
    } else if score >= EXPIRY_TRUST_FLOOR {
        // Window expired with a healthy mid-band score
        (TrustStatus::Trusted, false)
    } else {
        // Low mid-band at expiry: re-enter learning with a fresh window
        (TrustStatus::Learning, true)
    }
}

fn record_key(user_id: &str, device_id: &str) -> String {
    format!("{}:{}", user_id, device_id)
}

fn run_checks(record: &DeviceRecord, activity: &DeviceActivity) -> Vec<CheckResult> {
    let fingerprint = if record.usage_count == 0 {
        // First sighting has nothing to compare against
        CheckResult {
            check: CheckKind::FingerprintConsistency,
            verdict: Verdict::Pass,
            confidence: 0.3,
        }
    } else if fingerprint_hash(&activity.fingerprint) == record.fingerprint_hash {
        CheckResult {
            check: CheckKind::FingerprintConsistency,
            verdict: Verdict::Pass,
            confidence: 0.9,
        }
    } else {
        CheckResult {
            check: CheckKind::FingerprintConsistency,
            verdict: Verdict::Fail,
            confidence: 0.95,
        }
    };

    let behavior = match activity.behavior_anomalous {
        Some(false) => CheckResult {
            check: CheckKind::BehaviorConsistency,
            verdict: Verdict::Pass,
            confidence: activity.behavior_confidence.clamp(0.0, 1.0),
        },
        Some(true) => CheckResult {
            check: CheckKind::BehaviorConsistency,
            verdict: if activity.behavior_confidence > 0.7 {
                Verdict::Fail
            } else {
                Verdict::Suspicious
            },
            confidence: activity.behavior_confidence.clamp(0.0, 1.0),
        },
        None => CheckResult {
            check: CheckKind::BehaviorConsistency,
            verdict: Verdict::Suspicious,
            confidence: 0.0,
        },
    };

    let location = match activity.location_known {
        Some(true) => CheckResult {
            check: CheckKind::LocationConsistency,
            verdict: Verdict::Pass,
            confidence: activity.location_confidence.clamp(0.0, 1.0),
        },
        Some(false) => CheckResult {
            check: CheckKind::LocationConsistency,
            verdict: Verdict::Suspicious,
            confidence: activity.location_confidence.clamp(0.0, 1.0),
        },
        None => CheckResult {
            check: CheckKind::LocationConsistency,
            verdict: Verdict::Suspicious,
            confidence: 0.0,
        },
    };

    let temporal = match activity.hour_typical {
        Some(true) => CheckResult {
            check: CheckKind::TemporalPattern,
            verdict: Verdict::Pass,
            confidence: 0.7,
        },
        Some(false) => CheckResult {
            check: CheckKind::TemporalPattern,
            verdict: Verdict::Suspicious,
            confidence: 0.7,
        },
        None => CheckResult {
            check: CheckKind::TemporalPattern,
            verdict: Verdict::Suspicious,
            confidence: 0.0,
        },
    };

    vec![fingerprint, behavior, location, temporal]
}

fn candidate_score(record: &DeviceRecord, checks: &[CheckResult]) -> f64 {
    let weighted: f64 = checks
        .iter()
        .map(|c| {
            let weight = match c.check {
                CheckKind::FingerprintConsistency => WEIGHT_FINGERPRINT,
                CheckKind::BehaviorConsistency => WEIGHT_BEHAVIOR,
                CheckKind::LocationConsistency => WEIGHT_LOCATION,
                CheckKind::TemporalPattern => WEIGHT_TEMPORAL,
            };
            weight * c.effective()
        })
        .sum();

    let usage_bonus = (record.usage_count as f64 * USAGE_BONUS_PER_SIGHTING).min(USAGE_BONUS_CAP);
    let anomaly_penalty =
        (record.anomaly_count as f64 * ANOMALY_PENALTY_PER_EVENT).min(ANOMALY_PENALTY_CAP);

    clamp01(weighted + usage_bonus - anomaly_penalty)
}

// The live score moves toward the candidate by at most the step size
fn smooth(current: f64, candidate: f64, usage_count: u32) -> f64 {
    let step = if usage_count < NEW_DEVICE_USAGE {
        STEP_WHILE_NEW
    } else {
        STEP_ESTABLISHED
    };
    current + (candidate - current).clamp(-step, step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::ShardedMemoryStore;
    use chrono::TimeZone;

    fn store_with_clock() -> (DeviceTrustStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let config = EngineConfig::default();
        let store = DeviceTrustStore::new(
            &config,
            Arc::new(ShardedMemoryStore::new()),
            clock.clone(),
        );
        (store, clock)
    }

    fn good_activity() -> DeviceActivity {
        DeviceActivity {
            fingerprint: "fp-alpha".to_string(),
            behavior_anomalous: Some(false),
            behavior_confidence: 0.9,
            location_known: Some(true),
            location_confidence: 0.9,
            hour_typical: Some(true),
        }
    }

    fn bad_activity() -> DeviceActivity {
        DeviceActivity {
            fingerprint: "fp-other".to_string(),
            behavior_anomalous: Some(true),
            behavior_confidence: 0.9,
            location_known: Some(false),
            location_confidence: 0.9,
            hour_typical: Some(false),
        }
    }

    #[test]
    fn test_first_sighting_enters_learning() {
        let (store, _) = store_with_clock();
        let record = store.update("u1", "d1", &good_activity());

        assert_eq!(record.status, TrustStatus::Learning);
        assert_eq!(record.usage_count, 1);
        assert_eq!(record.fingerprint_hash, fingerprint_hash("fp-alpha"));
    }

    #[test]
    fn test_score_step_is_bounded() {
        let (store, _) = store_with_clock();
        store.update("u1", "d1", &good_activity());

        let mut previous = store.get("u1", "d1").unwrap().trust_score;
        for _ in 0..20 {
            let record = store.update("u1", "d1", &good_activity());
            let delta = (record.trust_score - previous).abs();
            assert!(delta <= STEP_WHILE_NEW + 1e-9, "step {} too large", delta);
            previous = record.trust_score;
        }
    }

    #[test]
    fn test_single_anomaly_cannot_block_a_learning_device() {
        let (store, _) = store_with_clock();
        store.update("u1", "d1", &good_activity());

        let record = store.update("u1", "d1", &bad_activity());
        assert!(record.trust_score > BLOCKED_CEILING);
        assert_ne!(record.status, TrustStatus::Blocked);
    }

    #[test]
    fn test_consistent_use_reaches_trusted() {
        let (store, _) = store_with_clock();
        let mut record = store.update("u1", "d1", &good_activity());
        for _ in 0..6 {
            record = store.update("u1", "d1", &good_activity());
        }
        assert!(record.trust_score >= TRUSTED_FLOOR);
        assert_eq!(record.status, TrustStatus::Trusted);
    }

    #[test]
    fn test_sustained_anomalies_reach_blocked() {
        let (store, _) = store_with_clock();
        store.update("u1", "d1", &good_activity());

        let mut record = store.get("u1", "d1").unwrap();
        for _ in 0..10 {
            record = store.update("u1", "d1", &bad_activity());
        }
        assert!(record.trust_score <= BLOCKED_CEILING);
        assert_eq!(record.status, TrustStatus::Blocked);
    }

    #[test]
    fn test_established_device_moves_slowly() {
        let (store, _) = store_with_clock();
        let mut record = store.update("u1", "d1", &good_activity());
        for _ in 0..12 {
            record = store.update("u1", "d1", &good_activity());
        }
        assert!(record.usage_count >= NEW_DEVICE_USAGE);

        let before = record.trust_score;
        let record = store.update("u1", "d1", &bad_activity());
        assert!((before - record.trust_score).abs() <= STEP_ESTABLISHED + 1e-9);
    }

    #[test]
    fn test_window_expiry_defaults_to_trusted_when_healthy() {
        let (store, clock) = store_with_clock();
        // Mixed activity keeps the score in the mid band
        let mixed = DeviceActivity {
            fingerprint: "fp-alpha".to_string(),
            behavior_anomalous: Some(false),
            behavior_confidence: 0.5,
            location_known: Some(true),
            location_confidence: 0.4,
            hour_typical: None,
        };
        let mut record = store.update("u1", "d1", &mixed);
        for _ in 0..3 {
            record = store.update("u1", "d1", &mixed);
        }
        assert_eq!(record.status, TrustStatus::Learning);
        assert!(record.trust_score >= EXPIRY_TRUST_FLOOR);
        assert!(record.trust_score < TRUSTED_FLOOR);

        clock.advance(Duration::days(15));
        let record = store.update("u1", "d1", &mixed);
        assert_eq!(record.status, TrustStatus::Trusted);
    }

    #[test]
    fn test_status_resolution_bands() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let in_window = now + Duration::days(7);
        let expired = now - Duration::days(1);

        assert_eq!(resolve_status(0.15, now, in_window), (TrustStatus::Blocked, false));
        assert_eq!(resolve_status(0.2, now, in_window), (TrustStatus::Blocked, false));
        assert_eq!(resolve_status(0.3, now, in_window), (TrustStatus::Suspicious, false));
        assert_eq!(resolve_status(0.85, now, in_window), (TrustStatus::Trusted, false));
        // Mid band inside the window stays learning
        assert_eq!(resolve_status(0.6, now, in_window), (TrustStatus::Learning, false));
        // Mid band after expiry defaults to trusted when healthy
        assert_eq!(resolve_status(0.6, now, expired), (TrustStatus::Trusted, false));
        // Low mid band after expiry extends the window
        assert_eq!(resolve_status(0.45, now, expired), (TrustStatus::Learning, true));
    }

    #[test]
    fn test_history_is_bounded() {
        let (store, _) = store_with_clock();
        let limit = EngineConfig::default().verification_history_limit;
        let mut record = store.update("u1", "d1", &good_activity());
        for _ in 0..(limit + 25) {
            record = store.update("u1", "d1", &good_activity());
        }
        assert_eq!(record.verification_history.len(), limit);
    }

    #[test]
    fn test_fingerprint_hash_is_stable_hex() {
        let h = fingerprint_hash("fp-alpha");
        assert_eq!(h.len(), 64);
        assert_eq!(h, fingerprint_hash("fp-alpha"));
        assert_ne!(h, fingerprint_hash("fp-beta"));
    }
}
