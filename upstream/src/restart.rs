use crate::config::FetchConfig;
use crate::metrics_defs::RESTART_TRIPS;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, warn};

struct Window {
    count: u32,
    window_start: Instant,
    last_restart: Option<Instant>,
}

/// Sliding failure window that decides when the process should restart.
///
/// Failures accumulate within a time window; a success resets the count. The
/// threshold only trips when the minimum interval since the previous trip has
/// passed, so a persistently broken upstream cannot restart-loop the service.
pub struct RestartPolicy {
    enabled: bool,
    threshold: u32,
    window: Duration,
    min_interval: Duration,
    state: Mutex<Window>,
}

impl RestartPolicy {
    pub fn new(fetch: &FetchConfig) -> Self {
        RestartPolicy {
            enabled: fetch.auto_restart_enabled,
            threshold: fetch.auto_restart_error_threshold.max(1),
            window: Duration::from_millis(fetch.auto_restart_window_ms),
            min_interval: Duration::from_millis(fetch.auto_restart_min_interval_ms),
            state: Mutex::new(Window {
                count: 0,
                window_start: Instant::now(),
                last_restart: None,
            }),
        }
    }

    /// Records a failure; returns true when the threshold trips.
    pub fn record_failure(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.window_start.elapsed() > self.window {
            state.count = 0;
            state.window_start = Instant::now();
        }
        state.count += 1;
        warn!(reason, count = state.count, threshold = self.threshold, "critical failure recorded");

        if !self.enabled || state.count < self.threshold {
            return false;
        }
        if let Some(last) = state.last_restart {
            if last.elapsed() < self.min_interval {
                return false;
            }
        }
        state.last_restart = Some(Instant::now());
        state.count = 0;
        true
    }

    pub fn record_success(&self) {
        self.state.lock().count = 0;
    }
}

/// Owns the restart policy and turns a trip into a shutdown request.
///
/// On trip it sends the reason down the shutdown channel for a graceful
/// exit, and arms a watchdog that force-exits if shutdown stalls.
pub struct Supervisor {
    policy: RestartPolicy,
    force_halt_after: Duration,
    shutdown_tx: mpsc::Sender<String>,
    tripped: AtomicBool,
}

impl Supervisor {
    pub fn new(fetch: &FetchConfig) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let supervisor = Arc::new(Supervisor {
            policy: RestartPolicy::new(fetch),
            force_halt_after: Duration::from_millis(fetch.auto_restart_force_halt_after_ms),
            shutdown_tx,
            tripped: AtomicBool::new(false),
        });
        (supervisor, shutdown_rx)
    }

    pub fn record_failure(&self, reason: &str) {
        if !self.policy.record_failure(reason) {
            return;
        }
        if self.tripped.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(reason, "failure threshold tripped, requesting restart");
        metrics::counter!(RESTART_TRIPS.name).increment(1);
        let _ = self.shutdown_tx.try_send(reason.to_string());

        if !self.force_halt_after.is_zero() {
            let halt_after = self.force_halt_after;
            tokio::spawn(async move {
                tokio::time::sleep(halt_after).await;
                error!("graceful shutdown stalled, forcing exit");
                std::process::exit(1);
            });
        }
    }

    pub fn record_success(&self) {
        self.policy.record_success();
    }

    #[cfg(test)]
    pub fn has_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}
