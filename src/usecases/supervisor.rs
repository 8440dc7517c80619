//! Supervisor - Monitor task lifecycle and ordered shutdown.
//!
//! Restarts the health monitor if it panics (its state lives behind an
//! `Arc` and survives) and runs the shutdown sequence: monitor first so
//! no new reconnect starts, then the publisher drain, then the upstream
//! logout, which waits out a reconnect still in flight. Every step is
//! bounded.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, instrument, warn};

use super::health_monitor::HealthMonitor;
use super::quote_ingress::QuoteIngress;
use super::stats::BridgeStats;
use super::tick_publisher::TickPublisher;

/// Pause before restarting a panicked monitor.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Budget for stopping the monitor and for the upstream logout.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervises the monitor task and coordinates shutdown.
pub struct Supervisor {
  /// Shutdown broadcaster shared with servers and the monitor.
  shutdown_tx: broadcast::Sender<()>,
  /// Set once shutdown begins; suppresses restarts.
  stopping: Arc<AtomicBool>,
  /// Monitor restarts after a panic.
  restarts: Arc<AtomicU32>,
  stats: Arc<BridgeStats>,
}

impl Supervisor {
  /// Create a supervisor around an existing shutdown channel.
  pub fn new(shutdown_tx: broadcast::Sender<()>, stats: Arc<BridgeStats>) -> Self {
    Self {
      shutdown_tx,
      stopping: Arc::new(AtomicBool::new(false)),
      restarts: Arc::new(AtomicU32::new(0)),
      stats,
    }
  }

  /// Monitor restarts so far.
  pub fn restarts(&self) -> u32 {
    self.restarts.load(Ordering::Relaxed)
  }

  /// Spawn the monitor loop with restart-on-panic.
  #[instrument(skip_all)]
  pub fn spawn_monitor(&self, monitor: Arc<HealthMonitor>) -> JoinHandle<()> {
    let shutdown_tx = self.shutdown_tx.clone();
    let stopping = Arc::clone(&self.stopping);
    let restarts = Arc::clone(&self.restarts);
    // Subscribed before spawning so an immediate shutdown is not missed.
    let mut first_rx = Some(self.shutdown_tx.subscribe());

    tokio::spawn(async move {
      loop {
        let shutdown_rx = first_rx.take().unwrap_or_else(|| shutdown_tx.subscribe());
        let task = tokio::spawn(Arc::clone(&monitor).run(shutdown_rx));

        match task.await {
          Ok(()) => {
            info!("Health monitor exited normally");
            break;
          }
          Err(e) if e.is_panic() => {
            if stopping.load(Ordering::Acquire) {
              break;
            }
            let count = restarts.fetch_add(1, Ordering::Relaxed) + 1;
            error!(restarts = count, "Health monitor panicked, restarting");
            sleep(RESTART_DELAY).await;
            if stopping.load(Ordering::Acquire) {
              break;
            }
          }
          Err(e) => {
            warn!(error = %e, "Health monitor task cancelled");
            break;
          }
        }
      }
    })
  }

  /// Ordered shutdown. Returns whether every step finished in time.
  #[instrument(skip_all)]
  pub async fn shutdown(
    &self,
    monitor_task: JoinHandle<()>,
    publisher: &TickPublisher,
    ingress: &QuoteIngress,
    publisher_grace: Duration,
  ) -> bool {
    self.stopping.store(true, Ordering::Release);
    self.stats.shutting_down.store(true, Ordering::Relaxed);
    let _ = self.shutdown_tx.send(());
    let mut clean = true;

    // 1. Monitor: no reconnects after this point.
    let mut monitor_task = monitor_task;
    if timeout(STEP_TIMEOUT, &mut monitor_task).await.is_err() {
      warn!("Health monitor did not stop in time, aborting");
      monitor_task.abort();
      clean = false;
    }

    // 2. Publisher: drain and flush.
    if !publisher.shutdown(publisher_grace).await {
      clean = false;
    }

    // 3. Upstream: unsubscribe and log out.
    if timeout(STEP_TIMEOUT, ingress.stop()).await.is_err() {
      warn!("Upstream logout did not finish in time");
      clean = false;
    }

    info!(clean, "Shutdown sequence complete");
    clean
  }
}
