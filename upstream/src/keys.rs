use crate::client::{ApiClient, HeaderKind, business_error};
use crate::errors::{ApiError, Result};
use crate::single_flight::SingleFlight;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct RegisterKeyData {
    key_version: i64,
    key_material: String,
}

/// Versioned decryption keys fetched from the register-key endpoint.
///
/// Keys are bound to the device identity that registered them, so the
/// rotator clears this registry whenever the identity changes. Concurrent
/// fetches for the same version coalesce into one upstream call.
pub struct KeyRegistry {
    client: Arc<ApiClient>,
    cache: Mutex<HashMap<i64, String>>,
    flight: SingleFlight<i64, String>,
}

impl KeyRegistry {
    pub fn new(client: Arc<ApiClient>) -> Self {
        KeyRegistry {
            client,
            cache: Mutex::new(HashMap::new()),
            flight: SingleFlight::new(),
        }
    }

    /// Key material for the given version, fetching on miss.
    pub async fn get_key(self: &Arc<Self>, version: i64) -> Result<String> {
        if let Some(key) = self.cache.lock().get(&version) {
            return Ok(key.clone());
        }
        let this = Arc::clone(self);
        self.flight
            .run(version, async move { this.fetch_key(version).await })
            .await
    }

    async fn fetch_key(&self, version: i64) -> Result<String> {
        let data = self.fetch_register_key().await?;
        debug!(key_version = data.key_version, "registered upstream key");

        // the endpoint always answers with its current version; a request
        // for an older version fails if that version is no longer served
        let mut cache = self.cache.lock();
        cache.insert(data.key_version, data.key_material);
        cache
            .get(&version)
            .cloned()
            .ok_or_else(|| ApiError::DecryptionFailed(format!("key version {version} unavailable")))
    }

    async fn fetch_register_key(&self) -> Result<RegisterKeyData> {
        let device = self.client.device_snapshot();
        let params = self.client.device_params(&device);
        let response = self
            .client
            .get_with_device(
                &device,
                self.client.base_url(),
                "/reading/crypt/registerkey",
                &params,
                HeaderKind::Common,
            )
            .await?;
        let json = response.json()?;
        if let Some(err) = business_error(&json) {
            return Err(err);
        }
        json.get("data")
            .cloned()
            .ok_or_else(|| ApiError::InvalidResponse("register key response missing data".into()))
            .and_then(|data| {
                serde_json::from_value(data)
                    .map_err(|e| ApiError::InvalidResponse(format!("register key data: {e}")))
            })
    }

    /// Drops every cached key; called when the device identity changes.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Fetches the current key and stores it. Best effort warm-up after a
    /// rotation; the caller logs failures instead of propagating them.
    pub async fn refresh(&self) -> Result<()> {
        let data = self.fetch_register_key().await?;
        info!(key_version = data.key_version, "refreshed upstream key");
        self.cache.lock().insert(data.key_version, data.key_material);
        Ok(())
    }

    #[cfg(test)]
    pub fn cached_versions(&self) -> Vec<i64> {
        self.cache.lock().keys().copied().collect()
    }
}
