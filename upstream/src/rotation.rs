use crate::config::ApiConfig;
use crate::device::{DeviceProfile, DeviceState};
use crate::keys::KeyRegistry;
use crate::metrics_defs::DEVICE_ROTATIONS;
use crate::search::SearchCoordinator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Whether an upstream error message indicates the current device identity
/// has been flagged by risk control.
pub fn is_risk_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["illegal_access", "risk", "风控", "forbidden", "permission"]
        .iter()
        .any(|marker| lower.contains(marker))
}

struct RotateGate {
    last_rotate_at: Option<Instant>,
}

/// Switches the active device identity when the upstream flags it.
///
/// Rotations are serialized through an async mutex and rate limited by a
/// cooldown, so a burst of failures from one bad identity produces a single
/// switch. A successful rotation invalidates the key registry, since
/// registered keys are bound to the identity that fetched them.
pub struct DeviceRotator {
    devices: Arc<DeviceState>,
    keys: Arc<KeyRegistry>,
    cooldown: Duration,
    gate: Mutex<RotateGate>,
}

impl DeviceRotator {
    pub fn new(devices: Arc<DeviceState>, keys: Arc<KeyRegistry>, api: &ApiConfig) -> Self {
        DeviceRotator {
            devices,
            keys,
            cooldown: Duration::from_millis(api.device_rotate_cooldown_ms),
            gate: Mutex::new(RotateGate {
                last_rotate_at: None,
            }),
        }
    }

    /// Cooldown-gated rotation. Returns the new profile, or `None` when the
    /// cooldown suppressed the rotation or no distinct identity exists.
    pub async fn rotate(&self, reason: &str) -> Option<Arc<DeviceProfile>> {
        self.rotate_inner(reason, false).await
    }

    /// Rotation that ignores the cooldown; used when every retry on the
    /// current identity has already been exhausted.
    pub async fn force_rotate(&self, reason: &str) -> Option<Arc<DeviceProfile>> {
        self.rotate_inner(reason, true).await
    }

    async fn rotate_inner(&self, reason: &str, ignore_cooldown: bool) -> Option<Arc<DeviceProfile>> {
        let rotated = {
            let mut gate = self.gate.lock().await;
            if !ignore_cooldown {
                if let Some(last) = gate.last_rotate_at {
                    if last.elapsed() < self.cooldown {
                        return None;
                    }
                }
            }
            let rotated = self.devices.rotate_pick()?;
            gate.last_rotate_at = Some(Instant::now());
            rotated
        };

        warn!(
            reason,
            device = rotated.label(),
            device_id = %rotated.device.device_id,
            "rotated to new device identity"
        );
        metrics::counter!(DEVICE_ROTATIONS.name).increment(1);

        // keys fetched under the previous identity are no longer valid
        self.keys.clear();
        if let Err(err) = self.keys.refresh().await {
            warn!(error = %err, "key refresh after rotation failed");
        }
        Some(rotated)
    }
}

/// Optional startup sweep: probe the pool with a trivial search until one
/// identity answers, leaving that identity active. Falls back to the
/// original selection when every probe fails.
pub async fn probe_startup(search: &SearchCoordinator, devices: &DeviceState, api: &ApiConfig) {
    let pool_len = devices.pool_len();
    let attempts = api.device_pool_probe_max_attempts.min(pool_len).max(1);
    let original = devices.active_index();

    for attempt in 0..attempts {
        let idx = (original + attempt) % pool_len;
        let profile = if attempt == 0 {
            devices.snapshot()
        } else {
            devices.select_index(idx)
        };
        match search.probe().await {
            Ok(true) => {
                info!(device = profile.label(), "startup probe succeeded");
                return;
            }
            Ok(false) => {
                warn!(device = profile.label(), "startup probe returned no results");
            }
            Err(err) => {
                warn!(device = profile.label(), error = %err, "startup probe failed");
            }
        }
    }

    warn!("all startup probes failed, keeping original device selection");
    devices.select_index(original);
}
