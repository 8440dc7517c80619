//! Prometheus Metrics Registry - Bridge Observability
//!
//! Registers and exposes Prometheus metrics on :9090 for Grafana
//! dashboards. Counters and gauges are copied from `BridgeStats` at
//! scrape time, so the hot path only touches atomics; batch latency is
//! observed into the histogram as each batch is acknowledged.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::usecases::stats::BridgeStats;

/// Centralized Prometheus metrics for the bridge.
///
/// All metrics follow the naming convention `tick_bridge_*`.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,
    /// Source of truth for every value.
    stats: Arc<BridgeStats>,
    /// Ticks by outcome (received, rejected, published, dropped).
    ticks: IntCounterVec,
    /// Batches by outcome (sent, failed).
    batches: IntCounterVec,
    /// Reconnects by outcome (succeeded, failed, skipped).
    reconnects: IntCounterVec,
    /// Monitor evaluation cycles.
    evaluations: IntCounter,
    /// Monitor state (0 healthy, 1 slow, 2 critical, 3 holiday).
    monitor_state: IntGauge,
    /// Seconds since the last tick.
    silence_seconds: IntGauge,
    /// Consecutive critical timeouts.
    consecutive_timeouts: IntGauge,
    /// Connection state (0 disconnected, 1 connecting, 2 connected, 3 expired).
    connection_state: IntGauge,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new(stats: Arc<BridgeStats>) -> anyhow::Result<Self> {
        let registry = Registry::new();

        let ticks = IntCounterVec::new(
            Opts::new("tick_bridge_ticks_total", "Ticks by outcome"),
            &["outcome"],
        )?;
        let batches = IntCounterVec::new(
            Opts::new("tick_bridge_batches_total", "Batches by outcome"),
            &["outcome"],
        )?;
        let publish_latency_us = Histogram::with_opts(
            HistogramOpts::new(
                "tick_bridge_publish_latency_us",
                "Batch send latency in microseconds",
            )
            .buckets(vec![
                250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 25_000.0, 50_000.0,
                100_000.0, 250_000.0, 1_000_000.0,
            ]),
        )?;
        let reconnects = IntCounterVec::new(
            Opts::new("tick_bridge_reconnects_total", "Reconnect attempts by outcome"),
            &["outcome"],
        )?;
        let evaluations = IntCounter::new(
            "tick_bridge_monitor_evaluations_total",
            "Monitor evaluation cycles",
        )?;
        let monitor_state = IntGauge::new(
            "tick_bridge_monitor_state",
            "Feed health (0=healthy, 1=slow, 2=critical_timeout, 3=holiday_suspected)",
        )?;
        let silence_seconds = IntGauge::new(
            "tick_bridge_silence_seconds",
            "Seconds since the last tick at the last evaluation",
        )?;
        let consecutive_timeouts = IntGauge::new(
            "tick_bridge_consecutive_timeouts",
            "Consecutive critical timeouts",
        )?;
        let connection_state = IntGauge::new(
            "tick_bridge_connection_state",
            "Upstream session (0=disconnected, 1=connecting, 2=connected, 3=session_expired)",
        )?;

        // Register all metrics
        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(batches.clone()))?;
        registry.register(Box::new(publish_latency_us.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(evaluations.clone()))?;
        registry.register(Box::new(monitor_state.clone()))?;
        registry.register(Box::new(silence_seconds.clone()))?;
        registry.register(Box::new(consecutive_timeouts.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;

        let installed = stats.on_publish_latency(move |latency| {
            publish_latency_us.observe(latency.as_micros() as f64);
        });
        if !installed {
            warn!("Latency observer already installed, histogram stays empty");
        }

        Ok(Self {
            registry,
            stats,
            ticks,
            batches,
            reconnects,
            evaluations,
            monitor_state,
            silence_seconds,
            consecutive_timeouts,
            connection_state,
        })
    }

    /// Copy current stats into the registry.
    pub fn refresh(&self) {
        let s = &self.stats;
        let counters: [(&IntCounterVec, &str, &std::sync::atomic::AtomicU64); 9] = [
            (&self.ticks, "received", &s.ticks_received),
            (&self.ticks, "rejected", &s.ticks_rejected),
            (&self.ticks, "published", &s.ticks_published),
            (&self.ticks, "dropped", &s.ticks_dropped),
            (&self.batches, "sent", &s.batches_sent),
            (&self.batches, "failed", &s.batches_failed),
            (&self.reconnects, "succeeded", &s.reconnects_succeeded),
            (&self.reconnects, "failed", &s.reconnects_failed),
            (&self.reconnects, "skipped", &s.reconnects_skipped),
        ];
        for (vec, outcome, value) in counters {
            catch_up(&vec.with_label_values(&[outcome]), BridgeStats::get(value));
        }

        catch_up(&self.evaluations, BridgeStats::get(&s.monitor_evaluations));
        self.monitor_state.set(s.monitor_state.load(Ordering::Relaxed));
        self.connection_state.set(s.connection_state.load(Ordering::Relaxed));
        self.silence_seconds
            .set(i64::try_from(BridgeStats::get(&s.silence_secs)).unwrap_or(i64::MAX));
        self.consecutive_timeouts
            .set(i64::try_from(BridgeStats::get(&s.consecutive_timeouts)).unwrap_or(i64::MAX));
    }

    /// Render the text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        self.refresh();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                async move {
                    match metrics.render() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => {
                            error!(error = %e, "Failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                        }
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}

/// Advance a monotonic counter to `target`.
fn catch_up(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_render_reflects_stats() {
        let stats = Arc::new(BridgeStats::new());
        let metrics = MetricsRegistry::new(Arc::clone(&stats)).unwrap();

        BridgeStats::add(&stats.ticks_received, 5);
        stats.record_batch(4, Duration::from_micros(250));
        stats.record_dropped(1);
        stats.monitor_state.store(2, Ordering::Relaxed);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"tick_bridge_ticks_total{outcome="received"} 5"#));
        assert!(text.contains(r#"tick_bridge_ticks_total{outcome="published"} 4"#));
        assert!(text.contains(r#"tick_bridge_ticks_total{outcome="dropped"} 1"#));
        assert!(text.contains("tick_bridge_monitor_state 2"));
        assert!(text.contains("tick_bridge_publish_latency_us_count 1"));
        assert!(text.contains(r#"tick_bridge_publish_latency_us_bucket{le="250"} 1"#));

        // Rendering twice must not double-count.
        let again = metrics.render().unwrap();
        assert!(again.contains(r#"tick_bridge_ticks_total{outcome="received"} 5"#));
    }
}
