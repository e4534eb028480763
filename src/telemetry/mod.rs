// Veritas Trust Engine: Telemetry Collector
// Captures interaction events during a live session, anonymizes them at the
// edge, and periodically flushes to behavior persistence. Collection is
// best-effort end to end: a failed flush is retried locally and a recording
// call outside a capture window is dropped, never surfaced to the user.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::BehaviorPersistence;
use crate::clock::{SharedClock, SharedIdGenerator};
use crate::config::EngineConfig;
use crate::utils::{round_coordinate, strip_query};

///////////////////////////////////////////////////////////////////////////////
// Event types
///////////////////////////////////////////////////////////////////////////////

// Key class recorded in place of the literal key. The raw character never
// enters the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyClass {
    Alphabetic,
    Numeric,
    Whitespace,
    Punctuation,
    Navigation,
    Modifier,
    Other,
}

impl KeyClass {
    pub fn classify(key: &str) -> Self {
        match key {
            "Backspace" | "Delete" | "ArrowUp" | "ArrowDown" | "ArrowLeft" | "ArrowRight"
            | "Home" | "End" | "PageUp" | "PageDown" | "Tab" => KeyClass::Navigation,
            "Shift" | "Control" | "Alt" | "Meta" | "CapsLock" => KeyClass::Modifier,
            " " | "Enter" | "Space" => KeyClass::Whitespace,
            _ => {
                let mut chars = key.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_alphabetic() => KeyClass::Alphabetic,
                    (Some(c), None) if c.is_numeric() => KeyClass::Numeric,
                    (Some(c), None) if c.is_ascii_punctuation() => KeyClass::Punctuation,
                    _ => KeyClass::Other,
                }
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingEvent {
    pub key_class: KeyClass,
    pub pressed_at_ms: u64,
    pub released_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerKind {
    Move,
    Click,
    Scroll,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PointerEvent {
    pub kind: PointerKind,
    pub x: u32,
    pub y: u32,
    pub at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavigationEvent {
    pub path: String,
    pub at_ms: u64,
    pub dwell_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FocusEvent {
    pub focused: bool,
    pub at_ms: u64,
}

// One capture window. Owned exclusively by the collector until flushed;
// immutable once persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetrySession {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub typing: Vec<TypingEvent>,
    pub pointer: Vec<PointerEvent>,
    pub navigation: Vec<NavigationEvent>,
    pub focus: Vec<FocusEvent>,
}

impl TelemetrySession {
    pub fn event_count(&self) -> usize {
        self.typing.len() + self.pointer.len() + self.navigation.len() + self.focus.len()
    }
}

// Per-session metrics handed to the behavior analyzer when capture ends
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BehaviorMetrics {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub captured_at: DateTime<Utc>,
    pub session_duration_secs: i64,
    pub typing_speed_cpm: f64,
    pub avg_key_press_ms: f64,
    pub typing_rhythm_variance: f64,
    pub pointer_speed_px_s: f64,
    pub pointer_path_straightness: f64, // 0.0 (erratic) to 1.0 (straight)
    pub avg_time_on_page_secs: f64,
    pub navigation_count: usize,
    pub focus_changes: usize,
    pub access_hour: u32,
    pub event_count: usize,
}

///////////////////////////////////////////////////////////////////////////////
// Privacy configuration
///////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrivacyConfig {
    // Pointer coordinates are rounded down to this granularity in pixels
    pub coordinate_rounding: u32,
    pub strip_query_strings: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        PrivacyConfig {
            coordinate_rounding: 10,
            strip_query_strings: true,
        }
    }
}

impl PrivacyConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        PrivacyConfig {
            coordinate_rounding: config.pointer_coordinate_rounding,
            strip_query_strings: true,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Collector
///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("No active capture session")]
    NoActiveSession,

    #[error("A capture session is already active: {0}")]
    CaptureAlreadyActive(String),

    #[error("Session discarded: {0}")]
    SessionDiscarded(String),
}

struct ActiveCapture {
    session: TelemetrySession,
    last_flush: DateTime<Utc>,
    // Events already delivered in previous flushes, so a re-flush only
    // carries the tail
    flushed_events: usize,
}

pub struct TelemetryCollector {
    privacy: PrivacyConfig,
    clock: SharedClock,
    ids: SharedIdGenerator,
    sink: Arc<dyn BehaviorPersistence>,
    active: Mutex<Option<ActiveCapture>>,
    retry_queue: Mutex<VecDeque<TelemetrySession>>,
    flush_interval: Duration,
    min_session_duration: Duration,
    min_session_events: usize,
}

impl TelemetryCollector {
    pub fn new(
        config: &EngineConfig,
        privacy: PrivacyConfig,
        clock: SharedClock,
        ids: SharedIdGenerator,
        sink: Arc<dyn BehaviorPersistence>,
    ) -> Self {
        TelemetryCollector {
            privacy,
            clock,
            ids,
            sink,
            active: Mutex::new(None),
            retry_queue: Mutex::new(VecDeque::new()),
            flush_interval: Duration::seconds(config.flush_interval_secs as i64),
            min_session_duration: Duration::seconds(config.min_session_duration_secs),
            min_session_events: config.min_session_events,
        }
    }

    /// Begin capturing for a user/device pair; returns the new session id
    pub fn start(&self, user_id: &str, device_id: &str) -> Result<String, TelemetryError> {
        let mut active = self.active.lock();
        if let Some(capture) = active.as_ref() {
            return Err(TelemetryError::CaptureAlreadyActive(
                capture.session.id.clone(),
            ));
        }

        let now = self.clock.now();
        let session = TelemetrySession {
            id: self.ids.next_id("tel"),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            started_at: now,
            ended_at: None,
            typing: Vec::new(),
            pointer: Vec::new(),
            navigation: Vec::new(),
            focus: Vec::new(),
        };
        let id = session.id.clone();

        *active = Some(ActiveCapture {
            session,
            last_flush: now,
            flushed_events: 0,
        });

        debug!("telemetry capture started: session={} user={}", id, user_id);
        Ok(id)
    }

    /// Record a keystroke. Only the key class is buffered, never the key.
    pub fn record_keystroke(&self, key: &str, pressed_at_ms: u64, released_at_ms: u64) {
        let mut active = self.active.lock();
        if let Some(capture) = active.as_mut() {
            capture.session.typing.push(TypingEvent {
                key_class: KeyClass::classify(key),
                pressed_at_ms,
                released_at_ms: released_at_ms.max(pressed_at_ms),
            });
        }
    }

    pub fn record_pointer(&self, kind: PointerKind, x: u32, y: u32, at_ms: u64) {
        let granularity = self.privacy.coordinate_rounding;
        let mut active = self.active.lock();
        if let Some(capture) = active.as_mut() {
            capture.session.pointer.push(PointerEvent {
                kind,
                x: round_coordinate(x, granularity),
                y: round_coordinate(y, granularity),
                at_ms,
            });
        }
    }

    pub fn record_navigation(&self, url: &str, at_ms: u64, dwell_ms: Option<u64>) {
        let path = if self.privacy.strip_query_strings {
            strip_query(url)
        } else {
            url.to_string()
        };
        let mut active = self.active.lock();
        if let Some(capture) = active.as_mut() {
            capture.session.navigation.push(NavigationEvent {
                path,
                at_ms,
                dwell_ms,
            });
        }
    }

    pub fn record_focus(&self, focused: bool, at_ms: u64) {
        let mut active = self.active.lock();
        if let Some(capture) = active.as_mut() {
            capture.session.focus.push(FocusEvent { focused, at_ms });
        }
    }

    /// True when the flush interval has elapsed since the last flush
    pub fn flush_due(&self) -> bool {
        let active = self.active.lock();
        match active.as_ref() {
            Some(capture) => self.clock.now() - capture.last_flush >= self.flush_interval,
            None => !self.retry_queue.lock().is_empty(),
        }
    }

    /// Flush buffered events to behavior persistence. A failed delivery is
    /// queued locally and retried on the next flush; it is never fatal.
    pub async fn flush(&self) {
        // Drain previously failed deliveries first
        loop {
            let pending = self.retry_queue.lock().pop_front();
            let Some(session) = pending else { break };
            if let Err(e) = self.sink.store_session(&session).await {
                warn!(
                    "telemetry flush retry failed: session={} reason={}",
                    session.id, e
                );
                self.retry_queue.lock().push_front(session);
                break;
            }
        }

        let snapshot = {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(capture) if capture.session.event_count() > capture.flushed_events => {
                    capture.last_flush = self.clock.now();
                    capture.flushed_events = capture.session.event_count();
                    Some(capture.session.clone())
                }
                Some(capture) => {
                    capture.last_flush = self.clock.now();
                    None
                }
                None => None,
            }
        };

        if let Some(session) = snapshot {
            if let Err(e) = self.sink.store_session(&session).await {
                warn!(
                    "telemetry flush failed, queuing locally: session={} reason={}",
                    session.id, e
                );
                self.retry_queue.lock().push_back(session);
            }
        }
    }

    /// End capture and return the computed metrics. Sessions shorter than the
    /// configured minimum or with too few events are discarded, not persisted.
    pub async fn stop(&self) -> Result<BehaviorMetrics, TelemetryError> {
        let mut session = {
            let mut active = self.active.lock();
            match active.take() {
                Some(capture) => capture.session,
                None => return Err(TelemetryError::NoActiveSession),
            }
        };

        let now = self.clock.now();
        session.ended_at = Some(now);

        let duration = now - session.started_at;
        if duration < self.min_session_duration {
            debug!(
                "telemetry session discarded, too short: session={} duration={}s",
                session.id,
                duration.num_seconds()
            );
            return Err(TelemetryError::SessionDiscarded(format!(
                "duration {}s below minimum",
                duration.num_seconds()
            )));
        }
        if session.event_count() < self.min_session_events {
            debug!(
                "telemetry session discarded, too few events: session={} events={}",
                session.id,
                session.event_count()
            );
            return Err(TelemetryError::SessionDiscarded(format!(
                "{} events below minimum",
                session.event_count()
            )));
        }

        let metrics = compute_metrics(&session, now);

        // Final flush; failure degrades to the local retry queue
        if let Err(e) = self.sink.store_session(&session).await {
            warn!(
                "final telemetry flush failed, queuing locally: session={} reason={}",
                session.id, e
            );
            self.retry_queue.lock().push_back(session);
        }

        Ok(metrics)
    }

    pub fn pending_retries(&self) -> usize {
        self.retry_queue.lock().len()
    }
}

///////////////////////////////////////////////////////////////////////////////
// Metric computation
///////////////////////////////////////////////////////////////////////////////

fn compute_metrics(session: &TelemetrySession, ended_at: DateTime<Utc>) -> BehaviorMetrics {
    let duration_secs = (ended_at - session.started_at).num_seconds().max(1);
    let duration_minutes = duration_secs as f64 / 60.0;

    let typing_speed_cpm = session.typing.len() as f64 / duration_minutes;

    let avg_key_press_ms = if session.typing.is_empty() {
        0.0
    } else {
        session
            .typing
            .iter()
            .map(|t| (t.released_at_ms - t.pressed_at_ms) as f64)
            .sum::<f64>()
            / session.typing.len() as f64
    };

    let typing_rhythm_variance = inter_key_variance(&session.typing);
    let (pointer_speed_px_s, pointer_path_straightness) = pointer_profile(&session.pointer);

    let avg_time_on_page_secs = {
        let dwells: Vec<f64> = session
            .navigation
            .iter()
            .filter_map(|n| n.dwell_ms.map(|d| d as f64 / 1000.0))
            .collect();
        if dwells.is_empty() {
            if session.navigation.is_empty() {
                duration_secs as f64
            } else {
                duration_secs as f64 / session.navigation.len() as f64
            }
        } else {
            dwells.iter().sum::<f64>() / dwells.len() as f64
        }
    };

    BehaviorMetrics {
        session_id: session.id.clone(),
        user_id: session.user_id.clone(),
        device_id: session.device_id.clone(),
        captured_at: ended_at,
        session_duration_secs: duration_secs,
        typing_speed_cpm,
        avg_key_press_ms,
        typing_rhythm_variance,
        pointer_speed_px_s,
        pointer_path_straightness,
        avg_time_on_page_secs,
        navigation_count: session.navigation.len(),
        focus_changes: session.focus.len(),
        access_hour: session.started_at.hour(),
        event_count: session.event_count(),
    }
}

fn inter_key_variance(typing: &[TypingEvent]) -> f64 {
    if typing.len() < 3 {
        return 0.0;
    }
    let intervals: Vec<f64> = typing
        .windows(2)
        .map(|w| w[1].pressed_at_ms.saturating_sub(w[0].pressed_at_ms) as f64)
        .collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64
}

// Returns (average speed px/s, path straightness). Straightness is the ratio
// of net displacement to total path length.
fn pointer_profile(pointer: &[PointerEvent]) -> (f64, f64) {
    let moves: Vec<&PointerEvent> = pointer
        .iter()
        .filter(|p| p.kind == PointerKind::Move)
        .collect();
    if moves.len() < 2 {
        return (0.0, 1.0);
    }

    let mut path_length = 0.0;
    for pair in moves.windows(2) {
        let dx = pair[1].x as f64 - pair[0].x as f64;
        let dy = pair[1].y as f64 - pair[0].y as f64;
        path_length += (dx * dx + dy * dy).sqrt();
    }

    let first = moves[0];
    let last = moves[moves.len() - 1];
    let dx = last.x as f64 - first.x as f64;
    let dy = last.y as f64 - first.y as f64;
    let net = (dx * dx + dy * dy).sqrt();

    let elapsed_ms = last.at_ms.saturating_sub(first.at_ms).max(1);
    let speed = path_length / (elapsed_ms as f64 / 1000.0);
    let straightness = if path_length > 0.0 {
        (net / path_length).clamp(0.0, 1.0)
    } else {
        1.0
    };

    (speed, straightness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InMemoryBehaviorStore;
    use crate::clock::{ManualClock, SequentialIdGenerator};
    use chrono::TimeZone;

    fn collector_with_store() -> (TelemetryCollector, Arc<InMemoryBehaviorStore>, Arc<ManualClock>)
    {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryBehaviorStore::new());
        let config = EngineConfig::default();
        let collector = TelemetryCollector::new(
            &config,
            PrivacyConfig::default(),
            clock.clone(),
            Arc::new(SequentialIdGenerator::new()),
            store.clone(),
        );
        (collector, store, clock)
    }

    fn record_normal_activity(collector: &TelemetryCollector) {
        for i in 0..20u64 {
            collector.record_keystroke("a", i * 200, i * 200 + 80);
        }
        for i in 0..10u64 {
            collector.record_pointer(PointerKind::Move, 100 + (i as u32) * 20, 200, i * 100);
        }
        collector.record_navigation("/dashboard?token=secret", 0, Some(5000));
        collector.record_focus(true, 0);
    }

    #[tokio::test]
    async fn test_capture_produces_metrics() {
        let (collector, _store, clock) = collector_with_store();
        collector.start("u1", "d1").unwrap();
        record_normal_activity(&collector);

        clock.advance(Duration::seconds(60));
        let metrics = collector.stop().await.unwrap();

        assert_eq!(metrics.user_id, "u1");
        assert_eq!(metrics.session_duration_secs, 60);
        assert_eq!(metrics.typing_speed_cpm, 20.0);
        assert!((metrics.avg_key_press_ms - 80.0).abs() < 1e-9);
        assert_eq!(metrics.access_hour, 14);
        assert_eq!(metrics.navigation_count, 1);
    }

    #[tokio::test]
    async fn test_keystrokes_are_anonymized() {
        let (collector, store, clock) = collector_with_store();
        collector.start("u1", "d1").unwrap();
        record_normal_activity(&collector);
        collector.record_keystroke("7", 5000, 5050);
        collector.record_keystroke("Shift", 5100, 5200);

        clock.advance(Duration::seconds(60));
        collector.stop().await.unwrap();

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        let serialized = serde_json::to_string(&sessions[0]).unwrap();
        // Only key classes survive; no literal key content
        assert!(!serialized.contains("\"key\""));
        assert!(serialized.contains("alphabetic"));
        assert!(serialized.contains("numeric"));
        assert!(serialized.contains("modifier"));
    }

    #[tokio::test]
    async fn test_query_strings_stripped_and_coordinates_rounded() {
        let (collector, store, clock) = collector_with_store();
        collector.start("u1", "d1").unwrap();
        record_normal_activity(&collector);
        collector.record_pointer(PointerKind::Click, 1237, 846, 900);

        clock.advance(Duration::seconds(60));
        collector.stop().await.unwrap();

        let session = store.sessions().remove(0);
        assert_eq!(session.navigation[0].path, "/dashboard");
        let click = session
            .pointer
            .iter()
            .find(|p| p.kind == PointerKind::Click)
            .unwrap();
        assert_eq!((click.x, click.y), (1230, 840));
    }

    #[tokio::test]
    async fn test_short_session_discarded() {
        let (collector, store, clock) = collector_with_store();
        collector.start("u1", "d1").unwrap();
        record_normal_activity(&collector);

        clock.advance(Duration::seconds(3));
        let result = collector.stop().await;
        assert!(matches!(result, Err(TelemetryError::SessionDiscarded(_))));
        assert!(store.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_sparse_session_discarded() {
        let (collector, _store, clock) = collector_with_store();
        collector.start("u1", "d1").unwrap();
        collector.record_focus(true, 0);

        clock.advance(Duration::seconds(60));
        let result = collector.stop().await;
        assert!(matches!(result, Err(TelemetryError::SessionDiscarded(_))));
    }

    #[tokio::test]
    async fn test_flush_failure_queues_and_retries() {
        let (collector, store, clock) = collector_with_store();
        collector.start("u1", "d1").unwrap();
        record_normal_activity(&collector);

        store.fail_next_writes(1);
        clock.advance(Duration::seconds(31));
        assert!(collector.flush_due());
        collector.flush().await;
        assert_eq!(collector.pending_retries(), 1);
        assert!(store.sessions().is_empty());

        // Next flush drains the retry queue
        collector.flush().await;
        assert_eq!(collector.pending_retries(), 0);
        assert_eq!(store.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (collector, _store, _clock) = collector_with_store();
        collector.start("u1", "d1").unwrap();
        assert!(matches!(
            collector.start("u1", "d1"),
            Err(TelemetryError::CaptureAlreadyActive(_))
        ));
    }

    #[test]
    fn test_key_classification() {
        assert_eq!(KeyClass::classify("a"), KeyClass::Alphabetic);
        assert_eq!(KeyClass::classify("5"), KeyClass::Numeric);
        assert_eq!(KeyClass::classify(" "), KeyClass::Whitespace);
        assert_eq!(KeyClass::classify(","), KeyClass::Punctuation);
        assert_eq!(KeyClass::classify("Backspace"), KeyClass::Navigation);
        assert_eq!(KeyClass::classify("Control"), KeyClass::Modifier);
        assert_eq!(KeyClass::classify("F13"), KeyClass::Other);
    }

    #[test]
    fn test_pointer_straightness_bounds() {
        // Straight horizontal sweep
        let straight: Vec<PointerEvent> = (0..10)
            .map(|i| PointerEvent {
                kind: PointerKind::Move,
                x: i * 50,
                y: 100,
                at_ms: i as u64 * 20,
            })
            .collect();
        let (_, straightness) = pointer_profile(&straight);
        assert!((straightness - 1.0).abs() < 1e-9);

        // Back-and-forth ends where it started
        let erratic = vec![
            PointerEvent { kind: PointerKind::Move, x: 0, y: 0, at_ms: 0 },
            PointerEvent { kind: PointerKind::Move, x: 500, y: 0, at_ms: 50 },
            PointerEvent { kind: PointerKind::Move, x: 0, y: 0, at_ms: 100 },
        ];
        let (_, straightness) = pointer_profile(&erratic);
        assert!(straightness < 1e-9);
    }
}
