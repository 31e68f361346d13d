use crate::device::DeviceProfile;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid search base url: {0}")]
    InvalidSearchBaseUrl(String),

    #[error("device_pool must contain at least one profile")]
    EmptyDevicePool,

    #[error("device_pool_size must be at least 1")]
    InvalidPoolSize,
}

/// Upstream API endpoint and device-pool configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,

    /// Separate base for the search endpoint; some deployments serve search
    /// from a sibling host. Falls back to `base_url`.
    pub search_base_url: Option<String>,

    /// Fingerprint profiles to cycle through on risk control.
    pub device_pool: Vec<DeviceProfile>,

    /// Only the first N pool entries are used.
    pub device_pool_size: usize,

    /// Shuffle the pool once at startup before selecting index 0.
    pub device_pool_shuffle_on_startup: bool,

    /// When set and matching a profile name, that profile wins over the
    /// shuffle selection.
    pub device_pool_startup_name: Option<String>,

    /// Probe the selected profile with a trivial search at startup and
    /// advance through the pool until one answers usably.
    pub device_pool_probe_on_startup: bool,

    pub device_pool_probe_max_attempts: usize,

    /// Minimum spacing between two rotations so a burst of risk-control
    /// responses cannot churn through the whole pool.
    pub device_rotate_cooldown_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: "https://api5-normal-sinfonlineb.fqnovel.com".into(),
            search_base_url: None,
            device_pool: Vec::new(),
            device_pool_size: 3,
            device_pool_shuffle_on_startup: true,
            device_pool_startup_name: None,
            device_pool_probe_on_startup: false,
            device_pool_probe_max_attempts: 3,
            device_rotate_cooldown_ms: 30_000,
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Url::parse(&self.base_url)
            .map_err(|e| ValidationError::InvalidBaseUrl(format!("{}: {e}", self.base_url)))?;
        if let Some(search) = &self.search_base_url {
            Url::parse(search)
                .map_err(|e| ValidationError::InvalidSearchBaseUrl(format!("{search}: {e}")))?;
        }
        if self.device_pool.is_empty() {
            return Err(ValidationError::EmptyDevicePool);
        }
        if self.device_pool_size == 0 {
            return Err(ValidationError::InvalidPoolSize);
        }
        Ok(())
    }

    pub fn search_base(&self) -> &str {
        self.search_base_url.as_deref().unwrap_or(&self.base_url)
    }
}

/// Tuning for upstream fetching: throttling, retries, caching and the
/// auto-restart supervisor.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Minimum interval between any two upstream requests (ms). 0 disables.
    pub request_interval_ms: u64,

    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    pub upstream_connect_timeout_ms: u64,
    pub upstream_read_timeout_ms: u64,

    /// Chapters fetched per bucket when a single-chapter request misses the
    /// cache. Capped to 30 at use.
    pub chapter_prefetch_size: usize,
    pub chapter_cache_max_entries: u64,
    pub chapter_cache_ttl_ms: u64,
    pub directory_cache_ttl_ms: u64,

    pub auto_restart_enabled: bool,
    pub auto_restart_error_threshold: u32,
    pub auto_restart_window_ms: u64,
    pub auto_restart_min_interval_ms: u64,
    /// After requesting graceful shutdown, force-exit once this elapses.
    /// 0 disables the watchdog.
    pub auto_restart_force_halt_after_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            request_interval_ms: 500,
            max_retries: 3,
            retry_delay_ms: 1500,
            retry_max_delay_ms: 10_000,
            upstream_connect_timeout_ms: 8000,
            upstream_read_timeout_ms: 15_000,
            chapter_prefetch_size: 30,
            chapter_cache_max_entries: 500,
            chapter_cache_ttl_ms: 30 * 60 * 1000,
            directory_cache_ttl_ms: 30 * 60 * 1000,
            auto_restart_enabled: true,
            auto_restart_error_threshold: 3,
            auto_restart_window_ms: 5 * 60 * 1000,
            auto_restart_min_interval_ms: 60 * 1000,
            auto_restart_force_halt_after_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn profile(name: &str) -> DeviceProfile {
        DeviceProfile {
            name: Some(name.into()),
            user_agent: "ua".into(),
            cookie: "cookie".into(),
            device: Device::default(),
        }
    }

    #[test]
    fn test_defaults() {
        let fetch = FetchConfig::default();
        assert_eq!(fetch.request_interval_ms, 500);
        assert_eq!(fetch.chapter_prefetch_size, 30);
        assert_eq!(fetch.auto_restart_error_threshold, 3);

        let api = ApiConfig::default();
        assert_eq!(api.device_pool_size, 3);
        assert!(api.device_pool_shuffle_on_startup);
        assert_eq!(api.search_base(), api.base_url);
    }

    #[test]
    fn test_validate() {
        let mut api = ApiConfig {
            device_pool: vec![profile("dev1")],
            ..Default::default()
        };
        assert!(api.validate().is_ok());

        api.base_url = "not-a-url".into();
        assert!(matches!(
            api.validate().unwrap_err(),
            ValidationError::InvalidBaseUrl(_)
        ));

        let api = ApiConfig::default();
        assert!(matches!(
            api.validate().unwrap_err(),
            ValidationError::EmptyDevicePool
        ));

        let api = ApiConfig {
            device_pool: vec![profile("dev1")],
            device_pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            api.validate().unwrap_err(),
            ValidationError::InvalidPoolSize
        ));
    }
}
