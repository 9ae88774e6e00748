//! Metrics collection for voice sessions
//!
//! Tracks per-attempt audio and tool counters and a bounded error history.
//! The capture pipe runs off the controller loop, so its counters are atomics
//! shared through an `Arc`; everything else is owned by the controller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Maximum number of finished attempts to retain in history
const MAX_ATTEMPT_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Frame counters updated by the capture pipe
#[derive(Debug, Default)]
pub struct CaptureCounters {
    captured: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureCounters {
    pub fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Metrics for one finished session attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptMetrics {
    pub attempt_id: String,
    pub started_at: DateTime<Utc>,
    /// Time from start to channel open, if it opened
    pub connect_ms: Option<u64>,
    pub duration_ms: u64,
    pub chunks_captured: u64,
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_rejected: u64,
    /// Seconds of model speech scheduled for playback
    pub audio_scheduled_secs: f64,
    pub tool_calls_ok: u64,
    pub tool_calls_failed: u64,
    /// Error title if the attempt ended in an error
    pub error: Option<String>,
}

/// Summary statistics across all attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_attempts: u64,
    /// Attempts whose channel opened
    pub connected_attempts: u64,
    /// Attempts that ended in an error
    pub failed_attempts: u64,
    pub tool_calls_ok: u64,
    pub tool_calls_failed: u64,
    /// Average time to open the channel (ms) across connected attempts
    pub avg_connect_ms: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of a classified session error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub attempt_id: Option<String>,
}

struct AttemptInProgress {
    attempt_id: Uuid,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    connect_time: Option<u64>,
    capture: Arc<CaptureCounters>,
    chunks_scheduled: u64,
    chunks_rejected: u64,
    audio_scheduled_secs: f64,
    tool_calls_ok: u64,
    tool_calls_failed: u64,
}

impl AttemptInProgress {
    fn new(attempt_id: Uuid) -> Self {
        Self {
            attempt_id,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            connect_time: None,
            capture: Arc::new(CaptureCounters::default()),
            chunks_scheduled: 0,
            chunks_rejected: 0,
            audio_scheduled_secs: 0.0,
            tool_calls_ok: 0,
            tool_calls_failed: 0,
        }
    }

    fn to_metrics(&self, error: Option<String>) -> AttemptMetrics {
        AttemptMetrics {
            attempt_id: self.attempt_id.to_string(),
            started_at: self.started_at_utc,
            connect_ms: self.connect_time,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            chunks_captured: self.capture.captured(),
            chunks_sent: self.capture.sent(),
            chunks_dropped: self.capture.dropped(),
            chunks_scheduled: self.chunks_scheduled,
            chunks_rejected: self.chunks_rejected,
            audio_scheduled_secs: self.audio_scheduled_secs,
            tool_calls_ok: self.tool_calls_ok,
            tool_calls_failed: self.tool_calls_failed,
            error,
        }
    }
}

/// Collects and stores metrics for session attempts
pub struct MetricsCollector {
    /// Finished attempts (newest first)
    history: VecDeque<AttemptMetrics>,
    /// Errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<AttemptInProgress>,
    total_attempts: u64,
    failed_attempts: u64,
    tool_calls_ok: u64,
    tool_calls_failed: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_ATTEMPT_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_attempts: 0,
            failed_attempts: 0,
            tool_calls_ok: 0,
            tool_calls_failed: 0,
        }
    }

    /// Start tracking a new attempt and return its capture counters.
    pub fn start_attempt(&mut self, attempt_id: Uuid) -> Arc<CaptureCounters> {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: discarding in-progress attempt {} to start {}",
                old.attempt_id,
                attempt_id
            );
            self.add_to_history(old.to_metrics(None));
        }

        log::debug!("Metrics: starting attempt {}", attempt_id);
        let attempt = AttemptInProgress::new(attempt_id);
        let counters = attempt.capture.clone();
        self.current = Some(attempt);
        self.total_attempts += 1;
        counters
    }

    pub fn connected(&mut self) {
        if let Some(ref mut attempt) = self.current {
            let ms = attempt.started_at.elapsed().as_millis() as u64;
            attempt.connect_time = Some(ms);
            log::info!(
                "Metrics: attempt {} connected after {}ms",
                attempt.attempt_id,
                ms
            );
        }
    }

    pub fn chunk_scheduled(&mut self, duration_secs: f64) {
        if let Some(ref mut attempt) = self.current {
            attempt.chunks_scheduled += 1;
            attempt.audio_scheduled_secs += duration_secs;
        }
    }

    pub fn chunk_rejected(&mut self) {
        if let Some(ref mut attempt) = self.current {
            attempt.chunks_rejected += 1;
        }
    }

    /// Count a finished tool invocation. Invocations that outlive their
    /// attempt still count towards the totals.
    pub fn tool_call_finished(&mut self, ok: bool) {
        if ok {
            self.tool_calls_ok += 1;
        } else {
            self.tool_calls_failed += 1;
        }
        if let Some(ref mut attempt) = self.current {
            if ok {
                attempt.tool_calls_ok += 1;
            } else {
                attempt.tool_calls_failed += 1;
            }
        }
    }

    /// Close the current attempt. No-op when none is in progress.
    pub fn attempt_ended(&mut self, error: Option<&AppError>) {
        let Some(attempt) = self.current.take() else {
            return;
        };

        let metrics = attempt.to_metrics(error.map(|e| e.title.clone()));
        log::info!(
            "Metrics: attempt {} ended after {}ms - captured {} (sent {}, dropped {}), \
             scheduled {} chunks ({:.1}s), tools {} ok / {} failed",
            metrics.attempt_id,
            metrics.duration_ms,
            metrics.chunks_captured,
            metrics.chunks_sent,
            metrics.chunks_dropped,
            metrics.chunks_scheduled,
            metrics.audio_scheduled_secs,
            metrics.tool_calls_ok,
            metrics.tool_calls_failed
        );

        if let Some(error) = error {
            self.failed_attempts += 1;
            self.record_error(error, Some(metrics.attempt_id.clone()));
        }
        self.add_to_history(metrics);
    }

    pub fn record_error(&mut self, error: &AppError, attempt_id: Option<String>) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            title: error.title.clone(),
            message: error.message.clone(),
            attempt_id,
        };

        log::debug!("Metrics: recording error - {:?}", record);

        self.errors.push_front(record);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let connected: Vec<u64> = self.history.iter().filter_map(|a| a.connect_ms).collect();
        let current_connected = self
            .current
            .as_ref()
            .map(|a| a.connect_time.is_some())
            .unwrap_or(false);

        let avg_connect_ms = if connected.is_empty() {
            0
        } else {
            connected.iter().sum::<u64>() / connected.len() as u64
        };

        MetricsSummary {
            total_attempts: self.total_attempts,
            connected_attempts: connected.len() as u64 + u64::from(current_connected),
            failed_attempts: self.failed_attempts,
            tool_calls_ok: self.tool_calls_ok,
            tool_calls_failed: self.tool_calls_failed,
            avg_connect_ms,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished attempts (newest first)
    pub fn get_history(&self) -> Vec<AttemptMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn add_to_history(&mut self, metrics: AttemptMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_ATTEMPT_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, Fault};

    fn connection_error() -> AppError {
        classify(&Fault::new("NetworkError", "socket closed"))
    }

    #[test]
    fn test_new_collector_is_empty() {
        let collector = MetricsCollector::new();
        let summary = collector.get_summary();

        assert_eq!(summary, MetricsSummary::default());
        assert!(collector.get_history().is_empty());
        assert!(collector.get_errors().is_empty());
    }

    #[test]
    fn test_successful_attempt_tracking() {
        let mut collector = MetricsCollector::new();
        let attempt_id = Uuid::new_v4();

        let counters = collector.start_attempt(attempt_id);
        collector.connected();

        counters.record_captured();
        counters.record_sent();
        collector.chunk_scheduled(0.5);
        collector.chunk_scheduled(0.25);
        collector.tool_call_finished(true);
        collector.attempt_ended(None);

        let summary = collector.get_summary();
        assert_eq!(summary.total_attempts, 1);
        assert_eq!(summary.connected_attempts, 1);
        assert_eq!(summary.failed_attempts, 0);
        assert_eq!(summary.tool_calls_ok, 1);

        let history = collector.get_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempt_id, attempt_id.to_string());
        assert_eq!(history[0].chunks_sent, 1);
        assert_eq!(history[0].chunks_scheduled, 2);
        assert!((history[0].audio_scheduled_secs - 0.75).abs() < 1e-9);
        assert!(history[0].error.is_none());
    }

    #[test]
    fn test_failed_attempt_records_error() {
        let mut collector = MetricsCollector::new();
        collector.start_attempt(Uuid::new_v4());
        collector.attempt_ended(Some(&connection_error()));

        let summary = collector.get_summary();
        assert_eq!(summary.failed_attempts, 1);
        assert_eq!(summary.connected_attempts, 0);
        let last = summary.last_error.unwrap();
        assert_eq!(last.title, "Server connection error");
        assert!(last.attempt_id.is_some());

        // Ending twice does nothing
        collector.attempt_ended(Some(&connection_error()));
        assert_eq!(collector.get_errors().len(), 1);
    }

    #[test]
    fn test_tool_calls_after_attempt_still_count() {
        let mut collector = MetricsCollector::new();
        collector.tool_call_finished(false);
        assert_eq!(collector.get_summary().tool_calls_failed, 1);
    }

    #[test]
    fn test_error_history_limit() {
        let mut collector = MetricsCollector::new();
        for _ in 0..(MAX_ERROR_HISTORY + 5) {
            collector.record_error(&connection_error(), None);
        }
        assert_eq!(collector.get_errors().len(), MAX_ERROR_HISTORY);
    }

    #[test]
    fn test_history_limit() {
        let mut collector = MetricsCollector::new();

        for _ in 0..(MAX_ATTEMPT_HISTORY + 10) {
            collector.start_attempt(Uuid::new_v4());
            collector.attempt_ended(None);
        }

        assert_eq!(collector.get_history().len(), MAX_ATTEMPT_HISTORY);
        assert_eq!(
            collector.get_summary().total_attempts,
            (MAX_ATTEMPT_HISTORY + 10) as u64
        );
    }
}
