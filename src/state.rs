//! # Application State Management
//!
//! Shared state accessed by HTTP handlers, the call socket actor, and the
//! playback scheduler's delivery tasks. All mutable data sits behind
//! `Arc<RwLock<T>>`: many readers or one writer, shared across actix workers.
//!
//! The metrics here are process-wide aggregates. Per-call state (the playback
//! job registry) deliberately lives in the scheduler, not here; this module
//! only counts what has happened.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers and
/// call actors.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Bridge-wide metrics (updated by middleware and the call path)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (never changes, safe to share directly)
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests and bridged calls.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors encountered since server start
    pub error_count: u64,

    /// Current number of live bridged calls
    pub active_calls: u32,

    /// Total calls accepted since server start
    pub total_calls: u64,

    /// Audio frames actually written to call sockets
    pub frames_delivered: u64,

    /// Turn results handed to the webhook dispatcher
    pub turns_dispatched: u64,

    /// Call-path errors (failed session init, invalid turn buffers)
    pub call_errors: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately so other threads are not
    /// blocked while the caller works with the snapshot.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Called when a call socket is accepted. Returns `false` if the
    /// concurrent-call limit is already reached; the caller must then reject
    /// the connection instead of bridging it.
    pub fn try_begin_call(&self, max_concurrent_calls: usize) -> bool {
        let mut metrics = self.metrics.write().unwrap();
        if (metrics.active_calls as usize) >= max_concurrent_calls {
            return false;
        }
        metrics.active_calls += 1;
        metrics.total_calls += 1;
        true
    }

    /// Called when a call reaches its terminal state.
    ///
    /// Underflow-guarded: teardown paths can race, and a double decrement
    /// must not wrap the gauge.
    pub fn end_call(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_calls > 0 {
            metrics.active_calls -= 1;
        }
    }

    pub fn record_frames_delivered(&self, count: u64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.frames_delivered += count;
    }

    pub fn record_turn_dispatched(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.turns_dispatched += 1;
    }

    pub fn record_call_error(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.call_errors += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// The snapshot is cloned under the read lock so the lock is not held
    /// while the HTTP response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_calls: metrics.active_calls,
            total_calls: metrics.total_calls,
            frames_delivered: metrics.frames_delivered,
            turns_dispatched: metrics.turns_dispatched,
            call_errors: metrics.call_errors,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = total duration / number of requests.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_call_gauge_respects_limit() {
        let state = AppState::new(AppConfig::default());
        assert!(state.try_begin_call(2));
        assert!(state.try_begin_call(2));
        assert!(!state.try_begin_call(2));

        state.end_call();
        assert!(state.try_begin_call(2));

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.active_calls, 2);
        assert_eq!(snapshot.total_calls, 3);
    }

    #[test]
    fn test_end_call_never_underflows() {
        let state = AppState::new(AppConfig::default());
        state.end_call();
        state.end_call();
        assert_eq!(state.get_metrics_snapshot().active_calls, 0);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.error_count, 1);
        assert!((metric.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
