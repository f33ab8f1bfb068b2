//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the campus-match live match
//! service using Prometheus metrics.

use crate::types::EndReason;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the live match service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Session lifecycle metrics
    session_metrics: SessionMetrics,

    /// Chat message metrics
    message_metrics: MessageMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Candidates pruned from the pool by the sweep task
    pub candidates_pruned_total: IntCounter,
}

/// Session lifecycle metrics
#[derive(Clone)]
pub struct SessionMetrics {
    /// Total searches started
    pub searches_started_total: IntCounter,

    /// Total searches cancelled before a match
    pub searches_cancelled_total: IntCounter,

    /// Total searches that expired without a match
    pub searches_expired_total: IntCounter,

    /// Total matches made
    pub matches_made_total: IntCounter,

    /// Total skips (end current match and research)
    pub skips_total: IntCounter,

    /// Total sessions ended, by who ended them
    pub sessions_ended_total: IntCounterVec,

    /// Users currently waiting in the candidate pool
    pub candidates_searching: IntGauge,

    /// Time from search start to match
    pub match_wait_time_seconds: Histogram,
}

/// Chat message metrics
#[derive(Clone)]
pub struct MessageMetrics {
    /// Total messages sent by local users
    pub messages_sent_total: IntCounter,

    /// Total messages received from partners
    pub messages_received_total: IntCounter,

    /// Messages that arrived after session end and were discarded
    pub messages_discarded_total: IntCounter,

    /// Outbound deliveries reported failed by the channel
    pub delivery_failures_total: IntCounter,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let session_metrics = SessionMetrics::new(&registry)?;
        let message_metrics = MessageMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            session_metrics,
            message_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Get service metrics
    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Get session metrics
    pub fn session(&self) -> &SessionMetrics {
        &self.session_metrics
    }

    /// Get message metrics
    pub fn message(&self) -> &MessageMetrics {
        &self.message_metrics
    }

    /// Record a search being started
    pub fn record_search_started(&self) {
        self.session_metrics.searches_started_total.inc();
    }

    /// Record a search being cancelled before resolution
    pub fn record_search_cancelled(&self) {
        self.session_metrics.searches_cancelled_total.inc();
    }

    /// Record a search expiring without a match
    pub fn record_search_expired(&self) {
        self.session_metrics.searches_expired_total.inc();
    }

    /// Record a match being made, with the time spent searching
    pub fn record_match_made(&self, wait: Duration) {
        self.session_metrics.matches_made_total.inc();
        self.session_metrics
            .match_wait_time_seconds
            .observe(wait.as_secs_f64());
    }

    /// Record a skip
    pub fn record_skip(&self) {
        self.session_metrics.skips_total.inc();
    }

    /// Record a session ending
    pub fn record_session_ended(&self, reason: EndReason) {
        let reason_str = match reason {
            EndReason::UserEnded => "user_ended",
            EndReason::PartnerLeft => "partner_left",
        };
        self.session_metrics
            .sessions_ended_total
            .with_label_values(&[reason_str])
            .inc();
    }

    /// Record an outbound message
    pub fn record_message_sent(&self) {
        self.message_metrics.messages_sent_total.inc();
    }

    /// Record an inbound message; `appended` is false when it arrived after
    /// the session ended and was discarded
    pub fn record_message_received(&self, appended: bool) {
        if appended {
            self.message_metrics.messages_received_total.inc();
        } else {
            self.message_metrics.messages_discarded_total.inc();
        }
    }

    /// Record an asynchronous delivery failure
    pub fn record_delivery_failure(&self) {
        self.message_metrics.delivery_failures_total.inc();
    }

    /// Update the currently-searching gauge from the pool
    pub fn update_searching_count(&self, count: usize) {
        self.session_metrics.candidates_searching.set(count as i64);
    }

    /// Record candidates removed by the sweep task
    pub fn record_candidates_pruned(&self, count: usize) {
        self.service_metrics
            .candidates_pruned_total
            .inc_by(count as u64);
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("campus_match_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "campus_match_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let candidates_pruned_total = IntCounter::new(
            "campus_match_candidates_pruned_total",
            "Disconnected candidates removed from the pool",
        )?;
        registry.register(Box::new(candidates_pruned_total.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            candidates_pruned_total,
        })
    }
}

impl SessionMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let searches_started_total = IntCounter::new(
            "campus_match_searches_started_total",
            "Total searches started",
        )?;
        registry.register(Box::new(searches_started_total.clone()))?;

        let searches_cancelled_total = IntCounter::new(
            "campus_match_searches_cancelled_total",
            "Total searches cancelled before a match",
        )?;
        registry.register(Box::new(searches_cancelled_total.clone()))?;

        let searches_expired_total = IntCounter::new(
            "campus_match_searches_expired_total",
            "Total searches that timed out",
        )?;
        registry.register(Box::new(searches_expired_total.clone()))?;

        let matches_made_total =
            IntCounter::new("campus_match_matches_made_total", "Total matches made")?;
        registry.register(Box::new(matches_made_total.clone()))?;

        let skips_total = IntCounter::new("campus_match_skips_total", "Total skips")?;
        registry.register(Box::new(skips_total.clone()))?;

        let sessions_ended_total = IntCounterVec::new(
            Opts::new("campus_match_sessions_ended_total", "Total sessions ended"),
            &["reason"],
        )?;
        registry.register(Box::new(sessions_ended_total.clone()))?;

        let candidates_searching = IntGauge::new(
            "campus_match_candidates_searching",
            "Users currently waiting for a partner",
        )?;
        registry.register(Box::new(candidates_searching.clone()))?;

        let match_wait_time_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "campus_match_match_wait_time_seconds",
                "Time from search start to match",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(match_wait_time_seconds.clone()))?;

        Ok(Self {
            searches_started_total,
            searches_cancelled_total,
            searches_expired_total,
            matches_made_total,
            skips_total,
            sessions_ended_total,
            candidates_searching,
            match_wait_time_seconds,
        })
    }
}

impl MessageMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let messages_sent_total = IntCounter::new(
            "campus_match_messages_sent_total",
            "Messages sent by local users",
        )?;
        registry.register(Box::new(messages_sent_total.clone()))?;

        let messages_received_total = IntCounter::new(
            "campus_match_messages_received_total",
            "Messages received from partners",
        )?;
        registry.register(Box::new(messages_received_total.clone()))?;

        let messages_discarded_total = IntCounter::new(
            "campus_match_messages_discarded_total",
            "Messages discarded after session end",
        )?;
        registry.register(Box::new(messages_discarded_total.clone()))?;

        let delivery_failures_total = IntCounter::new(
            "campus_match_delivery_failures_total",
            "Outbound deliveries reported failed",
        )?;
        registry.register(Box::new(delivery_failures_total.clone()))?;

        Ok(Self {
            messages_sent_total,
            messages_received_total,
            messages_discarded_total,
            delivery_failures_total,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        let _service = collector.service();
        let _session = collector.session();
        let _message = collector.message();
    }

    #[test]
    fn test_session_lifecycle_recording() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.record_search_started();
        collector.record_match_made(Duration::from_millis(1500));
        collector.record_skip();
        collector.record_session_ended(EndReason::PartnerLeft);

        assert_eq!(collector.session().searches_started_total.get(), 1);
        assert_eq!(collector.session().matches_made_total.get(), 1);
        assert_eq!(
            collector
                .session()
                .sessions_ended_total
                .with_label_values(&["partner_left"])
                .get(),
            1
        );
    }

    #[test]
    fn test_message_recording() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.record_message_sent();
        collector.record_message_received(true);
        collector.record_message_received(false);
        collector.record_delivery_failure();

        assert_eq!(collector.message().messages_sent_total.get(), 1);
        assert_eq!(collector.message().messages_received_total.get(), 1);
        assert_eq!(collector.message().messages_discarded_total.get(), 1);
        assert_eq!(collector.message().delivery_failures_total.get(), 1);
    }

    #[test]
    fn test_health_and_pool_updates() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.update_health_status(2);
        collector.update_searching_count(7);
        collector.record_candidates_pruned(3);

        assert_eq!(collector.service().health_status.get(), 2);
        assert_eq!(collector.session().candidates_searching.get(), 7);
    }

    #[test]
    fn test_metrics_timer() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");
        let timer = collector.start_timer();

        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(10));
        assert!(timer.stop() >= Duration::from_millis(10));
    }
}
