//! Metrics collection for voice sessions
//!
//! Tracks connect latency, session length, audio traffic and error history.
//! Used for diagnostics; the binary prints the summary on exit.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::audio::LinkStats;

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for one finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    /// Unix timestamp when connect was requested (seconds)
    pub started_at: u64,
    /// Time from connect request to live session, if it got that far
    pub time_to_connect_ms: Option<u64>,
    /// Total session time in milliseconds
    pub duration_ms: u64,
    /// Microphone chunks handed to the transport
    pub chunks_sent: u64,
    /// Microphone chunks dropped (not open yet, or queue full)
    pub chunks_dropped: u64,
    /// Speech chunks scheduled for playback
    pub chunks_received: u64,
    /// Inbound payloads that failed to decode
    pub decode_failures: u64,
    /// Barge-in interruptions
    pub interruptions: u64,
    /// Why the session ended ("user", "remote closed", an error message, ...)
    pub end_reason: String,
}

impl SessionRecord {
    pub fn connected(&self) -> bool {
        self.time_to_connect_ms.is_some()
    }
}

/// Summary statistics across all recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    /// Sessions that reached the connected state
    pub connected_sessions: u64,
    pub failed_sessions: u64,
    pub avg_time_to_connect_ms: u64,
    pub avg_session_duration_ms: u64,
    pub total_interruptions: u64,
    pub total_decode_failures: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "configuration", "device", "transport")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    connected_after: Option<u64>,
    chunks_received: u64,
    decode_failures: u64,
    interruptions: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl SessionInProgress {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            connected_after: None,
            chunks_received: 0,
            decode_failures: 0,
            interruptions: 0,
        }
    }

    fn to_record(&self, link: LinkStats, end_reason: String) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_unix,
            time_to_connect_ms: self.connected_after,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            chunks_sent: link.sent,
            chunks_dropped: link.dropped_not_open + link.dropped_backpressure,
            chunks_received: self.chunks_received,
            decode_failures: self.decode_failures,
            interruptions: self.interruptions,
            end_reason,
        }
    }
}

/// Collects and stores metrics for voice sessions
pub struct SessionMetrics {
    /// Finished sessions (newest first)
    history: VecDeque<SessionRecord>,
    /// Errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    total_sessions: u64,
    connected_sessions: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_sessions: 0,
            connected_sessions: 0,
        }
    }

    /// Start tracking a new session. An unfinished previous one is closed out.
    pub fn start_session(&mut self, session_id: Uuid) {
        if self.current.is_some() {
            log::warn!(
                "Metrics: session {} started while another was still open",
                session_id
            );
            self.end_session(LinkStats::default(), "superseded".to_string());
        }

        log::debug!("Metrics: starting session {}", session_id);
        self.current = Some(SessionInProgress::new(session_id));
        self.total_sessions += 1;
    }

    pub fn session_connected(&mut self) {
        if let Some(ref mut session) = self.current {
            if session.connected_after.is_none() {
                let ms = session.started_at.elapsed().as_millis() as u64;
                session.connected_after = Some(ms);
                self.connected_sessions += 1;
                log::info!(
                    "Metrics: session {} connected after {}ms",
                    session.session_id,
                    ms
                );
            }
        }
    }

    pub fn chunk_received(&mut self) {
        if let Some(ref mut session) = self.current {
            session.chunks_received += 1;
        }
    }

    pub fn decode_failed(&mut self) {
        if let Some(ref mut session) = self.current {
            session.decode_failures += 1;
        }
    }

    pub fn interrupted(&mut self) {
        if let Some(ref mut session) = self.current {
            session.interruptions += 1;
        }
    }

    /// Close out the current session. No-op when none is open.
    pub fn end_session(&mut self, link: LinkStats, end_reason: String) {
        if let Some(session) = self.current.take() {
            let record = session.to_record(link, end_reason);
            log::info!(
                "Metrics: session {} ended after {}ms ({}) - sent {}, dropped {}, received {}, interruptions {}",
                record.session_id,
                record.duration_ms,
                record.end_reason,
                record.chunks_sent,
                record.chunks_dropped,
                record.chunks_received,
                record.interruptions
            );
            self.add_to_history(record);
        }
    }

    pub fn record_error(&mut self, error_type: &str, message: String, session_id: Option<Uuid>) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type: error_type.to_string(),
            message,
            session_id: session_id.map(|id| id.to_string()),
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let connected: Vec<_> = self.history.iter().filter(|s| s.connected()).collect();
        let count = connected.len() as u64;

        let (avg_connect, avg_duration) = if count > 0 {
            let sum_connect: u64 = connected.iter().filter_map(|s| s.time_to_connect_ms).sum();
            let sum_duration: u64 = connected.iter().map(|s| s.duration_ms).sum();
            (sum_connect / count, sum_duration / count)
        } else {
            (0, 0)
        };

        // A session still connecting has neither succeeded nor failed
        let pending = self
            .current
            .as_ref()
            .is_some_and(|s| s.connected_after.is_none()) as u64;

        MetricsSummary {
            total_sessions: self.total_sessions,
            connected_sessions: self.connected_sessions,
            failed_sessions: self
                .total_sessions
                .saturating_sub(self.connected_sessions + pending),
            avg_time_to_connect_ms: avg_connect,
            avg_session_duration_ms: avg_duration,
            total_interruptions: self.history.iter().map(|s| s.interruptions).sum(),
            total_decode_failures: self.history.iter().map(|s| s.decode_failures).sum(),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished sessions (newest first)
    pub fn history(&self) -> Vec<SessionRecord> {
        self.history.iter().cloned().collect()
    }

    /// Errors (newest first)
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_session(&self, session_id: Uuid) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.session_id == session_id)
    }

    fn add_to_history(&mut self, record: SessionRecord) {
        self.history.push_front(record);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_empty() {
        let metrics = SessionMetrics::new();
        let summary = metrics.summary();

        assert_eq!(summary.total_sessions, 0);
        assert_eq!(summary.connected_sessions, 0);
        assert!(summary.last_error.is_none());
        assert!(metrics.history().is_empty());
        assert!(metrics.errors().is_empty());
    }

    #[test]
    fn test_connecting_session_is_not_failed() {
        let mut metrics = SessionMetrics::new();
        metrics.start_session(Uuid::new_v4());

        let summary = metrics.summary();
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.failed_sessions, 0);

        metrics.end_session(LinkStats::default(), "Connection Error: refused".to_string());
        assert_eq!(metrics.summary().failed_sessions, 1);

        metrics.start_session(Uuid::new_v4());
        metrics.session_connected();
        let summary = metrics.summary();
        assert_eq!(summary.connected_sessions, 1);
        assert_eq!(summary.failed_sessions, 1);
    }

    #[test]
    fn test_connected_session_tracking() {
        let mut metrics = SessionMetrics::new();
        let id = Uuid::new_v4();

        metrics.start_session(id);
        assert!(metrics.is_active_session(id));
        std::thread::sleep(std::time::Duration::from_millis(10));
        metrics.session_connected();
        metrics.session_connected();
        metrics.chunk_received();
        metrics.chunk_received();
        metrics.decode_failed();
        metrics.interrupted();
        metrics.end_session(
            LinkStats {
                sent: 5,
                dropped_not_open: 2,
                dropped_backpressure: 1,
            },
            "user".to_string(),
        );

        assert!(!metrics.is_active_session(id));
        let history = metrics.history();
        assert_eq!(history.len(), 1);
        let record = &history[0];
        assert!(record.connected());
        assert!(record.time_to_connect_ms.unwrap() >= 10);
        assert_eq!(record.chunks_sent, 5);
        assert_eq!(record.chunks_dropped, 3);
        assert_eq!(record.chunks_received, 2);
        assert_eq!(record.decode_failures, 1);
        assert_eq!(record.interruptions, 1);
        assert_eq!(record.end_reason, "user");

        let summary = metrics.summary();
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.connected_sessions, 1);
        assert_eq!(summary.failed_sessions, 0);
        assert_eq!(summary.total_interruptions, 1);
    }

    #[test]
    fn test_failed_session_tracking() {
        let mut metrics = SessionMetrics::new();
        let id = Uuid::new_v4();

        metrics.start_session(id);
        metrics.record_error("transport", "timeout".to_string(), Some(id));
        metrics.end_session(LinkStats::default(), "timeout".to_string());

        let summary = metrics.summary();
        assert_eq!(summary.failed_sessions, 1);
        let last = summary.last_error.unwrap();
        assert_eq!(last.error_type, "transport");
        assert_eq!(last.session_id, Some(id.to_string()));
        assert!(!metrics.history()[0].connected());
    }

    #[test]
    fn test_end_without_session_is_noop() {
        let mut metrics = SessionMetrics::new();
        metrics.end_session(LinkStats::default(), "user".to_string());
        metrics.chunk_received();
        assert!(metrics.history().is_empty());
    }

    #[test]
    fn test_history_limit() {
        let mut metrics = SessionMetrics::new();

        for i in 0..(MAX_SESSION_HISTORY + 10) {
            metrics.start_session(Uuid::new_v4());
            let link = LinkStats {
                sent: i as u64,
                ..LinkStats::default()
            };
            metrics.end_session(link, "user".to_string());
        }

        let history = metrics.history();
        assert_eq!(history.len(), MAX_SESSION_HISTORY);
        assert!(history[0].chunks_sent > history[MAX_SESSION_HISTORY - 1].chunks_sent);
    }

    #[test]
    fn test_error_history_limit() {
        let mut metrics = SessionMetrics::new();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            metrics.record_error("device", format!("error {}", i), None);
        }
        let errors = metrics.errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        assert_eq!(errors[0].message, format!("error {}", MAX_ERROR_HISTORY + 4));
    }
}
