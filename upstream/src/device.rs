use crate::config::{ApiConfig, ValidationError};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Hardware/app identifiers the upstream fingerprints a client by.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Device {
    pub device_id: String,
    pub install_id: String,
    pub cdid: String,
    pub aid: String,
    pub version_code: String,
    pub version_name: String,
    pub update_version_code: String,
    pub device_brand: String,
    pub device_type: String,
    pub rom_version: String,
    pub resolution: String,
    pub dpi: String,
    pub host_abi: String,
    pub os_version: String,
    pub os_api: String,
}

impl Default for Device {
    fn default() -> Self {
        Device {
            device_id: "933935730452521".into(),
            install_id: "933935730456617".into(),
            cdid: "17f05006-423a-4172-be4b-7d26a42f2f4a".into(),
            aid: "1967".into(),
            version_code: "68132".into(),
            version_name: "6.8.1.32".into(),
            update_version_code: "68132".into(),
            device_brand: "OnePlus".into(),
            device_type: "OnePlus11".into(),
            rom_version: "V291IR+release-keys".into(),
            resolution: "3200*1440".into(),
            dpi: "640".into(),
            host_abi: "arm64-v8a".into(),
            os_version: "13".into(),
            os_api: "32".into(),
        }
    }
}

/// One fingerprint identity from the configured pool. Immutable once loaded.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceProfile {
    /// Optional label for logs.
    #[serde(default)]
    pub name: Option<String>,
    pub user_agent: String,
    pub cookie: String,
    #[serde(default)]
    pub device: Device,
}

impl DeviceProfile {
    /// The pair the upstream's risk control keys on; rotation never selects
    /// a profile whose identity equals the active one's.
    pub fn identity(&self) -> (&str, &str) {
        (&self.device.device_id, &self.device.install_id)
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

/// The device pool plus the currently active profile.
///
/// Readers take a snapshot and use it for a whole request, so no request ever
/// observes a half-rotated identity. Writers go through [`select_index`] or
/// [`rotate_pick`], which are serialized by the rotation mutex upstack.
///
/// [`select_index`]: DeviceState::select_index
/// [`rotate_pick`]: DeviceState::rotate_pick
pub struct DeviceState {
    pool: Vec<Arc<DeviceProfile>>,
    active: RwLock<Arc<DeviceProfile>>,
    active_idx: AtomicUsize,
    cursor: AtomicUsize,
}

impl DeviceState {
    /// Startup selection: honor `device_pool_startup_name` when it matches,
    /// otherwise optionally shuffle and take index 0. The rotation cursor is
    /// parked just past the selection.
    pub fn from_config(api: &ApiConfig) -> Result<Self, ValidationError> {
        let size = api.device_pool_size.max(1);
        let mut pool: Vec<Arc<DeviceProfile>> = api
            .device_pool
            .iter()
            .take(size)
            .cloned()
            .map(Arc::new)
            .collect();
        if pool.is_empty() {
            return Err(ValidationError::EmptyDevicePool);
        }

        let mut selected = api
            .device_pool_startup_name
            .as_deref()
            .and_then(|name| pool.iter().position(|p| p.name.as_deref() == Some(name)));
        if selected.is_none() {
            if api.device_pool_shuffle_on_startup && pool.len() > 1 {
                pool.shuffle(&mut rand::thread_rng());
            }
            selected = Some(0);
        }
        let selected = selected.unwrap_or(0);

        let profile = pool[selected].clone();
        info!(
            device = profile.label(),
            device_id = %profile.device.device_id,
            install_id = %profile.device.install_id,
            pool_size = pool.len(),
            "selected startup device"
        );

        let cursor = (selected + 1) % pool.len();
        Ok(DeviceState {
            pool,
            active: RwLock::new(profile),
            active_idx: AtomicUsize::new(selected),
            cursor: AtomicUsize::new(cursor),
        })
    }

    /// Coherent snapshot of the active profile; valid for a whole request.
    pub fn snapshot(&self) -> Arc<DeviceProfile> {
        self.active.read().clone()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn active_index(&self) -> usize {
        self.active_idx.load(Ordering::Acquire)
    }

    /// Makes the given pool index active (startup probe advancing through
    /// the pool). The cursor moves just past it.
    pub fn select_index(&self, idx: usize) -> Arc<DeviceProfile> {
        let idx = idx % self.pool.len();
        let profile = self.pool[idx].clone();
        *self.active.write() = profile.clone();
        self.active_idx.store(idx, Ordering::Release);
        self.cursor.store((idx + 1) % self.pool.len(), Ordering::Release);
        profile
    }

    /// Scans forward from the cursor for the first profile whose identity
    /// differs from the active one and makes it active. Returns `None` when
    /// the pool holds no distinct identity. Callers serialize via the
    /// rotation mutex.
    pub(crate) fn rotate_pick(&self) -> Option<Arc<DeviceProfile>> {
        let len = self.pool.len();
        let current = self.snapshot();
        let start = self.cursor.load(Ordering::Acquire);
        for step in 0..len {
            let idx = (start + step) % len;
            let candidate = &self.pool[idx];
            if candidate.identity() != current.identity() {
                *self.active.write() = candidate.clone();
                self.active_idx.store(idx, Ordering::Release);
                self.cursor.store((idx + 1) % len, Ordering::Release);
                return Some(candidate.clone());
            }
        }
        None
    }
}
