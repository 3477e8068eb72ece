//! Alert Aggregator
//!
//! Single injected collaborator through which every component raises
//! operational notifications.
//!
//! - **Rate limit**: at most `max_per_window` immediate deliveries per
//!   category per rolling `window_minutes`; anything beyond is folded into a
//!   pending batch for that category.
//! - **Bulk mode**: while a backfill runs, alerts below `bulk_min_severity`
//!   always go to the batch.
//! - **Flush**: one summary per category with a pending batch, carrying the
//!   count and a few samples.
//!
//! Delivery is best-effort: failures are logged and never reach the caller.

mod sinks;

pub use sinks::{LogSink, MemorySink, NotificationSink, WebhookSink};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use crate::error::AlertError;
use statline_common::config::{AlertsConfig, Severity};
use statline_common::time::Clock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One notification candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub category: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            category: category.into(),
            context: BTreeMap::new(),
            timestamp: statline_common::time::now(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn degraded_extraction(processor: &str, data_unit_key: &str, chain: &str, detail: &str) -> Self {
        Self::new(
            Severity::Warning,
            "extraction_degraded",
            format!("Degraded data for {}", chain),
            format!("{} used degraded data for {}: {}", processor, data_unit_key, detail),
        )
        .with_context("processor", processor)
        .with_context("data_unit_key", data_unit_key)
        .with_context("chain", chain)
    }

    pub fn chain_exhausted(processor: &str, data_unit_key: &str, chain: &str, issues: &[String]) -> Self {
        Self::new(
            Severity::Error,
            "chain_exhausted",
            format!("All sources failed for {}", chain),
            format!("{} could not resolve {} for {}", processor, chain, data_unit_key),
        )
        .with_context("processor", processor)
        .with_context("data_unit_key", data_unit_key)
        .with_context("chain", chain)
        .with_context("issues", json!(issues))
    }

    pub fn stale_run_superseded(processor: &str, data_unit_key: &str, run_id: &str, age_minutes: i64) -> Self {
        Self::new(
            Severity::Warning,
            "stale_run",
            format!("Stale run superseded for {}", processor),
            format!(
                "Run {} for {} was running for {} min; starting a new attempt",
                run_id, data_unit_key, age_minutes
            ),
        )
        .with_context("processor", processor)
        .with_context("data_unit_key", data_unit_key)
        .with_context("run_id", run_id)
        .with_context("age_minutes", age_minutes)
    }

    pub fn unusable_quality(processor: &str, data_unit_key: &str, chain: &str, score: u8) -> Self {
        Self::new(
            Severity::Warning,
            "quality_unusable",
            format!("Unusable quality for {}", chain),
            format!(
                "{} produced score {} for {}; not eligible for predictions",
                processor, score, data_unit_key
            ),
        )
        .with_context("processor", processor)
        .with_context("data_unit_key", data_unit_key)
        .with_context("chain", chain)
        .with_context("score", score)
    }

    pub fn run_log_unavailable(processor: &str, data_unit_key: &str, error: &str) -> Self {
        Self::new(
            Severity::Critical,
            "run_log_unavailable",
            "Run log append failed",
            format!(
                "{} aborted {} because the run could not be recorded: {}",
                processor, data_unit_key, error
            ),
        )
        .with_context("processor", processor)
        .with_context("data_unit_key", data_unit_key)
    }
}

/// What `notify` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDisposition {
    Delivered,
    /// Admitted for delivery but the sink failed; logged and absorbed
    DeliveryFailed,
    /// Over the category's window limit; batched
    RateLimited,
    /// Below the bulk-mode severity floor; batched
    BulkSuppressed,
}

#[derive(Debug)]
struct PendingBatch {
    count: usize,
    max_severity: Severity,
    samples: Vec<AlertEvent>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

pub struct AlertAggregator {
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: AlertsConfig,
    bulk_mode: AtomicBool,
    /// Category → timestamps of immediate deliveries inside the window
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    pending: DashMap<String, PendingBatch>,
}

impl AlertAggregator {
    pub fn new(sink: Arc<dyn NotificationSink>, clock: Arc<dyn Clock>, config: AlertsConfig) -> Self {
        Self {
            sink,
            clock,
            config,
            bulk_mode: AtomicBool::new(false),
            windows: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Webhook sink when `webhook_url` is set, otherwise the tracing log
    pub fn from_config(config: &AlertsConfig, clock: Arc<dyn Clock>) -> Result<Self, AlertError> {
        let sink: Arc<dyn NotificationSink> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookSink::new(url.clone(), config.webhook_timeout())?),
            None => Arc::new(LogSink::new()),
        };
        Ok(Self::new(sink, clock, config.clone()))
    }

    pub fn set_bulk_mode(&self, enabled: bool) {
        self.bulk_mode.store(enabled, Ordering::SeqCst);
        info!(enabled, "Alert bulk mode changed");
    }

    pub fn is_bulk_mode(&self) -> bool {
        self.bulk_mode.load(Ordering::SeqCst)
    }

    /// Raise an alert; never fails
    ///
    /// The event is restamped with the aggregator's clock so its timestamp
    /// agrees with the rate-limit window it is counted in.
    pub async fn notify(&self, mut event: AlertEvent) -> AlertDisposition {
        event.timestamp = self.clock.now();

        if self.is_bulk_mode() && event.severity < self.config.bulk_min_severity {
            debug!(
                category = %event.category,
                severity = %event.severity,
                "Bulk mode: alert batched"
            );
            self.add_to_batch(event);
            return AlertDisposition::BulkSuppressed;
        }

        if !self.try_acquire_slot(&event.category) {
            debug!(
                category = %event.category,
                max_per_window = self.config.max_per_window,
                "Rate limit reached: alert batched"
            );
            self.add_to_batch(event);
            return AlertDisposition::RateLimited;
        }

        self.deliver(&event).await
    }

    /// Prune, check and record under the category's shard lock so two
    /// racing callers cannot both take the last slot
    fn try_acquire_slot(&self, category: &str) -> bool {
        let now = self.clock.now();
        let cutoff = now - self.config.window();
        let max = self.config.max_per_window as usize;

        let mut window = self.windows.entry(category.to_string()).or_default();
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
        if window.len() < max {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    fn add_to_batch(&self, event: AlertEvent) {
        let now = self.clock.now();
        let sample_size = self.config.sample_size;

        let mut batch = self
            .pending
            .entry(event.category.clone())
            .or_insert_with(|| PendingBatch {
                count: 0,
                max_severity: event.severity,
                samples: Vec::new(),
                first_seen: now,
                last_seen: now,
            });
        batch.count += 1;
        batch.max_severity = batch.max_severity.max(event.severity);
        batch.last_seen = now;
        if batch.samples.len() < sample_size {
            batch.samples.push(event);
        }
    }

    async fn deliver(&self, event: &AlertEvent) -> AlertDisposition {
        match self.sink.deliver(event).await {
            Ok(()) => AlertDisposition::Delivered,
            Err(e) => {
                warn!(
                    sink = self.sink.name(),
                    category = %event.category,
                    title = %event.title,
                    error = %e,
                    "Alert delivery failed"
                );
                AlertDisposition::DeliveryFailed
            }
        }
    }

    /// Number of alerts waiting in `category`'s batch
    pub fn pending_count(&self, category: &str) -> usize {
        self.pending.get(category).map(|b| b.count).unwrap_or(0)
    }

    /// Emit one summary per pending category and clear the batches
    ///
    /// Summaries bypass the rate limit. Returns the number of summaries emitted.
    pub async fn flush(&self) -> usize {
        let mut categories: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        categories.sort();

        let mut emitted = 0;
        for category in categories {
            let Some((category, batch)) = self.pending.remove(&category) else {
                continue;
            };

            let count = batch.count;
            let summary = summarize(&category, batch, self.clock.now());
            info!(category = %category, count, "Flushing alert batch");
            self.deliver(&summary).await;
            emitted += 1;
        }
        emitted
    }
}

fn summarize(category: &str, batch: PendingBatch, now: DateTime<Utc>) -> AlertEvent {
    let samples: Vec<Value> = batch
        .samples
        .iter()
        .map(|e| {
            json!({
                "severity": e.severity,
                "title": e.title,
                "message": e.message,
                "timestamp": e.timestamp,
            })
        })
        .collect();

    let titles: Vec<&str> = batch.samples.iter().map(|e| e.title.as_str()).collect();

    AlertEvent::new(
        batch.max_severity,
        category,
        format!("{} batched alert(s) in {}", batch.count, category),
        format!("Batched alerts, e.g.: {}", titles.join("; ")),
    )
    .at(now)
    .with_context("count", batch.count)
    .with_context("samples", samples)
    .with_context("first_seen", batch.first_seen.to_rfc3339())
    .with_context("last_seen", batch.last_seen.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use statline_common::time::ManualClock;

    fn aggregator() -> (AlertAggregator, MemorySink, Arc<ManualClock>) {
        let sink = MemorySink::new();
        let clock = Arc::new(ManualClock::starting_now());
        let aggregator =
            AlertAggregator::new(Arc::new(sink.clone()), clock.clone(), AlertsConfig::default());
        (aggregator, sink, clock)
    }

    fn incomplete(n: usize) -> AlertEvent {
        AlertEvent::new(
            Severity::Warning,
            "phase2_incomplete",
            format!("Phase 2 incomplete #{}", n),
            "missing boxscores",
        )
    }

    #[tokio::test]
    async fn test_events_stamped_with_injected_clock() {
        let (aggregator, sink, clock) = aggregator();
        let start = Utc.with_ymd_and_hms(2025, 11, 28, 18, 0, 0).unwrap();
        clock.set(start);

        aggregator.notify(incomplete(0)).await;
        clock.advance(chrono::Duration::minutes(90));
        aggregator.set_bulk_mode(true);
        aggregator.notify(incomplete(1)).await;
        aggregator.flush().await;

        let events = sink.events();
        assert_eq!(events[0].timestamp, start);
        assert_eq!(
            events[1].context["samples"][0]["timestamp"],
            json!(start + chrono::Duration::minutes(90))
        );
        assert_eq!(events[1].timestamp, start + chrono::Duration::minutes(90));
    }

    #[tokio::test]
    async fn test_sixth_alert_in_window_is_batched() {
        let (aggregator, sink, _) = aggregator();

        for n in 0..5 {
            assert_eq!(aggregator.notify(incomplete(n)).await, AlertDisposition::Delivered);
        }
        assert_eq!(aggregator.notify(incomplete(5)).await, AlertDisposition::RateLimited);
        assert_eq!(sink.count(), 5);
        assert_eq!(aggregator.pending_count("phase2_incomplete"), 1);

        assert_eq!(aggregator.flush().await, 1);
        let events = sink.events();
        assert_eq!(events.len(), 6);
        assert_eq!(events[5].context["count"], json!(1));
        assert_eq!(events[5].context["samples"][0]["title"], json!("Phase 2 incomplete #5"));
        assert_eq!(aggregator.pending_count("phase2_incomplete"), 0);
    }

    #[tokio::test]
    async fn test_window_rolls_over() {
        let (aggregator, sink, clock) = aggregator();

        for n in 0..6 {
            aggregator.notify(incomplete(n)).await;
        }
        clock.advance(chrono::Duration::minutes(61));

        assert_eq!(aggregator.notify(incomplete(6)).await, AlertDisposition::Delivered);
        assert_eq!(sink.count(), 6);
    }

    #[tokio::test]
    async fn test_categories_limited_independently() {
        let (aggregator, sink, _) = aggregator();

        for n in 0..5 {
            aggregator.notify(incomplete(n)).await;
        }
        let other = AlertEvent::new(Severity::Warning, "stale_run", "Stale", "run superseded");
        assert_eq!(aggregator.notify(other).await, AlertDisposition::Delivered);
        assert_eq!(sink.count(), 6);
    }

    #[tokio::test]
    async fn test_bulk_mode_batches_below_threshold() {
        let (aggregator, sink, _) = aggregator();
        aggregator.set_bulk_mode(true);

        assert_eq!(aggregator.notify(incomplete(0)).await, AlertDisposition::BulkSuppressed);
        let severe = AlertEvent::new(Severity::Critical, "run_log_unavailable", "Down", "db gone");
        assert_eq!(aggregator.notify(severe).await, AlertDisposition::Delivered);
        assert_eq!(sink.count(), 1);

        aggregator.set_bulk_mode(false);
        assert_eq!(aggregator.notify(incomplete(1)).await, AlertDisposition::Delivered);
    }

    #[tokio::test]
    async fn test_flush_summary_uses_max_severity_and_caps_samples() {
        let (aggregator, sink, _) = aggregator();
        aggregator.set_bulk_mode(true);

        for n in 0..4 {
            aggregator.notify(incomplete(n)).await;
        }
        let error = AlertEvent::new(Severity::Error, "phase2_incomplete", "Hard miss", "no data");
        // Error is at the bulk floor, so it is delivered immediately
        assert_eq!(aggregator.notify(error).await, AlertDisposition::Delivered);

        aggregator.flush().await;
        let summary = sink.events().pop().unwrap();
        assert_eq!(summary.severity, Severity::Warning);
        assert_eq!(summary.context["count"], json!(4));
        assert_eq!(summary.context["samples"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_absorbed() {
        let (aggregator, sink, _) = aggregator();
        sink.set_failing(true);

        assert_eq!(aggregator.notify(incomplete(0)).await, AlertDisposition::DeliveryFailed);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending() {
        let (aggregator, sink, _) = aggregator();
        assert_eq!(aggregator.flush().await, 0);
        assert_eq!(sink.count(), 0);
    }
}
