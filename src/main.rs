//! Tick Bridge - Entry Point
//!
//! Initializes configuration, logging, the upstream session and the
//! event log publisher, then runs the liveness monitor until
//! SIGINT/SIGTERM.
//!
//! Wiring sequence:
//! 1. Load .env + config.toml, validate
//! 2. Init tracing (JSON structured logging)
//! 3. Load upstream credentials from env (QUOTE_API_KEY, QUOTE_SECRET_KEY)
//! 4. Build exchange calendar
//! 5. Create event log adapter + TickPublisher (flush task)
//! 6. Create WebSocket quote source + QuoteIngress
//! 7. Establish the upstream session (bounded attempts, exit non-zero on failure)
//! 8. Spawn metrics (:9090) and health (/live + /ready) servers
//! 9. Spawn the supervised HealthMonitor
//! 10. Wait for SIGINT/SIGTERM → monitor stop → publisher drain → logout

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use tick_bridge::adapters::metrics::{HealthServer, MetricsRegistry};
use tick_bridge::adapters::publisher::{FileLogPublisher, RestProxyPublisher};
use tick_bridge::adapters::source::WsQuoteSource;
use tick_bridge::config::{self, AppConfig, PublisherKind};
use tick_bridge::ports::clock::{Clock, SystemClock};
use tick_bridge::ports::event_publisher::EventPublisher;
use tick_bridge::ports::quote_source::{Credentials, QuoteSource};
use tick_bridge::usecases::{
  monitor_channel, BridgeStats, HealthMonitor, IngressSettings, PublisherSettings, QuoteIngress,
  Supervisor, TickPublisher,
};

/// Config file path override.
const ENV_CONFIG_PATH: &str = "BRIDGE_CONFIG";

/// First delay between startup login attempts, doubled each time.
const STARTUP_BACKOFF: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
  // ── 1. Load .env and configuration ──────────────────────
  let _ = dotenvy::dotenv();
  let config_path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| "config.toml".to_string());
  let config = config::loader::load_config(&config_path)
    .context("Failed to load configuration")?;

  // ── 2. Initialize structured JSON logging ───────────────
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.bridge.log_level)),
    )
    .json()
    .init();

  info!(
    name = %config.bridge.name,
    version = env!("CARGO_PKG_VERSION"),
    symbols = ?config.bridge.symbols,
    timezone = %config.bridge.timezone,
    publisher = ?config.publisher.kind,
    topic = %config.publisher.topic,
    "Starting tick bridge"
  );

  // ── 3. Upstream credentials ─────────────────────────────
  let credentials = config::loader::credentials_from_env(|key| std::env::var(key).ok())
    .context("Failed to load upstream credentials from env")?;

  // ── 4. Exchange calendar ────────────────────────────────
  let calendar = Arc::new(config::loader::build_calendar(&config)?);
  let clock: Arc<dyn Clock> = Arc::new(SystemClock);
  let stats = Arc::new(BridgeStats::new());
  let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(4);

  // ── 5. Event log + publisher ────────────────────────────
  let sink = build_sink(&config).await?;
  if !sink.is_healthy().await {
    warn!(sink = sink.name(), "Event log not reachable yet, batches will retry");
  }
  let publisher = Arc::new(TickPublisher::spawn(
    sink,
    PublisherSettings::from(&config.publisher),
    Arc::clone(&stats),
  ));

  // ── 6. Quote source + ingress ───────────────────────────
  let source: Arc<dyn QuoteSource> = Arc::new(WsQuoteSource::new(
    config.source.url.clone(),
    config.source.login_timeout(),
  ));
  let (link, inbox) = monitor_channel(clock.now());
  let ingress = Arc::new(QuoteIngress::new(
    source,
    Arc::clone(&publisher),
    Arc::clone(&clock),
    link,
    IngressSettings {
      symbols: config.bridge.symbols.clone(),
      exchange_tz: calendar.timezone(),
      reconnect_timeout: config.monitor.reconnect_timeout(),
      login_attempts_per_minute: config.source.login_attempts_per_minute,
    },
    Arc::clone(&stats),
  ));

  // ── 7. Establish the upstream session ───────────────────
  if let Err(e) = establish_session(&ingress, &credentials, config.source.startup_attempts).await {
    error!(error = %e, "Initial upstream session failed, exiting");
    publisher.shutdown(config.publisher.shutdown_grace()).await;
    return Err(e);
  }

  // ── 8. Metrics + health servers ─────────────────────────
  let mut server_handles = Vec::new();
  if config.metrics.enabled {
    let metrics = Arc::new(MetricsRegistry::new(Arc::clone(&stats))?);
    let bind = config.metrics.bind_address.clone();
    let rx = shutdown_tx.subscribe();
    server_handles.push(tokio::spawn(async move {
      if let Err(e) = metrics.serve(bind, rx).await {
        error!(error = %e, "Metrics server failed");
      }
    }));

    let health = HealthServer::new(Arc::clone(&stats), config.metrics.health_port);
    let rx = shutdown_tx.subscribe();
    server_handles.push(tokio::spawn(async move {
      if let Err(e) = health.run(rx).await {
        error!(error = %e, "Health server failed");
      }
    }));
  }

  // ── 9. Supervised health monitor ────────────────────────
  let monitor = Arc::new(HealthMonitor::new(
    Arc::clone(&ingress),
    Arc::clone(&calendar),
    Arc::clone(&clock),
    &config.monitor,
    inbox,
    Arc::clone(&stats),
  ));
  let supervisor = Supervisor::new(shutdown_tx.clone(), Arc::clone(&stats));
  let monitor_task = supervisor.spawn_monitor(monitor);

  info!("All tasks spawned - bridge is running");

  // ── 10. Wait for SIGINT or SIGTERM ──────────────────────
  wait_for_signal().await;

  let clean = supervisor
    .shutdown(monitor_task, &publisher, &ingress, config.publisher.shutdown_grace())
    .await;
  for handle in server_handles {
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
  }

  info!(
    ticks_received = BridgeStats::get(&stats.ticks_received),
    ticks_published = BridgeStats::get(&stats.ticks_published),
    ticks_dropped = BridgeStats::get(&stats.ticks_dropped),
    monitor_restarts = supervisor.restarts(),
    "Shutdown complete"
  );
  anyhow::ensure!(clean, "Shutdown did not complete within its time budget");
  Ok(())
}

/// Build the configured `EventPublisher`.
async fn build_sink(config: &AppConfig) -> Result<Arc<dyn EventPublisher>> {
  let publisher = &config.publisher;
  Ok(match publisher.kind {
    PublisherKind::RestProxy => Arc::new(
      RestProxyPublisher::new(
        &publisher.broker_url,
        &publisher.cluster_id,
        &publisher.topic,
        publisher.request_timeout(),
      )
      .context("Failed to create REST proxy client")?,
    ),
    PublisherKind::File => Arc::new(
      FileLogPublisher::open(&publisher.data_dir, &publisher.topic)
        .await
        .context("Failed to open file event log")?,
    ),
  })
}

/// Log in with bounded attempts and jittered exponential backoff.
async fn establish_session(
  ingress: &QuoteIngress,
  credentials: &Credentials,
  attempts: u32,
) -> Result<()> {
  let mut delay = STARTUP_BACKOFF;
  for attempt in 1..=attempts {
    match ingress.start(credentials).await {
      Ok(()) => return Ok(()),
      Err(e) if attempt < attempts => {
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        let wait = delay.mul_f64(jitter);
        warn!(attempt, attempts, error = %e, wait_ms = wait.as_millis(), "Startup login failed, retrying");
        tokio::time::sleep(wait).await;
        delay = delay.saturating_mul(2);
      }
      Err(e) => {
        return Err(anyhow::Error::new(e).context(format!("Upstream login failed after {attempts} attempts")));
      }
    }
  }
  anyhow::bail!("No startup attempts configured")
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn wait_for_signal() {
  #[cfg(unix)]
  {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut sigterm) => {
        tokio::select! {
          _ = signal::ctrl_c() => info!("SIGINT received, initiating graceful shutdown"),
          _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
        }
        return;
      }
      Err(e) => warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only"),
    }
  }
  if let Err(e) = signal::ctrl_c().await {
    error!(error = %e, "Failed to listen for SIGINT");
  }
  info!("SIGINT received, initiating graceful shutdown");
}
