use crate::config::{ApiConfig, FetchConfig};
use crate::device::{DeviceProfile, DeviceState};
use crate::errors::{ApiError, Result};
use crate::metrics_defs::UPSTREAM_CALLS;
use crate::rate_limit::RateLimiter;
use crate::signing::SignatureClient;
use flate2::read::GzDecoder;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use indexmap::IndexMap;
use rand::Rng;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Which header template a request uses. Search requests additionally carry
/// an empty bearer slot the signer expects to see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderKind {
    Common,
    Search,
}

/// A decoded upstream response: status, headers, and the body as text with
/// any gzip layer already removed.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl UpstreamResponse {
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("body is not valid json: {e}")))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Maps a business envelope with a non-zero code to an error.
pub fn business_error(value: &serde_json::Value) -> Option<ApiError> {
    let code = value.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
    if code == 0 {
        return None;
    }
    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("upstream error")
        .to_string();
    Some(ApiError::Upstream { code, message })
}

/// Signed, throttled HTTP access to the upstream API.
///
/// Every request goes through the rate limiter and the signing oracle; the
/// header order matters to the upstream, so headers are built as an ordered
/// map and only converted to the wire form at send time.
pub struct ApiClient {
    http: reqwest::Client,
    api: ApiConfig,
    devices: Arc<DeviceState>,
    signer: SignatureClient,
    limiter: Arc<RateLimiter>,
}

impl ApiClient {
    pub fn new(
        api: ApiConfig,
        fetch: &FetchConfig,
        devices: Arc<DeviceState>,
        signer: SignatureClient,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(fetch.upstream_connect_timeout_ms))
            .timeout(Duration::from_millis(fetch.upstream_read_timeout_ms))
            .build()
            .map_err(|e| ApiError::Transport(format!("http client init: {e}")))?;
        Ok(ApiClient {
            http,
            api,
            devices,
            signer,
            limiter: Arc::new(RateLimiter::new(fetch.request_interval_ms)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.api.base_url
    }

    pub fn search_base(&self) -> &str {
        self.api.search_base()
    }

    pub fn device_snapshot(&self) -> Arc<DeviceProfile> {
        self.devices.snapshot()
    }

    /// Baseline headers in the order the upstream expects.
    fn common_headers(&self, device: &DeviceProfile) -> IndexMap<String, String> {
        let mut rng = rand::thread_rng();
        let request_id = format!("{:016x}{:016x}", rng.r#gen::<u64>(), rng.r#gen::<u64>());
        let mut headers = IndexMap::new();
        headers.insert("accept".to_string(), "application/json".to_string());
        headers.insert("accept-encoding".to_string(), "gzip".to_string());
        headers.insert("user-agent".to_string(), device.user_agent.clone());
        headers.insert("cookie".to_string(), device.cookie.clone());
        headers.insert("x-reading-request".to_string(), request_id);
        headers.insert("install-id".to_string(), device.device.install_id.clone());
        headers.insert("device-id".to_string(), device.device.device_id.clone());
        headers.insert("aid".to_string(), device.device.aid.clone());
        headers
    }

    /// Search headers add an empty bearer slot directly after
    /// `x-reading-request` when none is configured in the cookie profile.
    fn search_headers(&self, device: &DeviceProfile) -> IndexMap<String, String> {
        let base = self.common_headers(device);
        if base.keys().any(|k| k.eq_ignore_ascii_case("authorization")) {
            return base;
        }
        let mut headers = IndexMap::with_capacity(base.len() + 1);
        let mut inserted = false;
        for (name, value) in base {
            let is_anchor = name.eq_ignore_ascii_case("x-reading-request");
            headers.insert(name, value);
            if is_anchor {
                headers.insert("authorization".to_string(), "Bearer".to_string());
                inserted = true;
            }
        }
        if !inserted {
            headers.insert("authorization".to_string(), "Bearer".to_string());
        }
        headers
    }

    /// Fingerprint query parameters attached to every upstream request.
    pub fn device_params(&self, device: &DeviceProfile) -> Vec<(&'static str, String)> {
        let d = &device.device;
        vec![
            ("device_id", d.device_id.clone()),
            ("iid", d.install_id.clone()),
            ("cdid", d.cdid.clone()),
            ("aid", d.aid.clone()),
            ("version_code", d.version_code.clone()),
            ("version_name", d.version_name.clone()),
            ("update_version_code", d.update_version_code.clone()),
            ("device_brand", d.device_brand.clone()),
            ("device_type", d.device_type.clone()),
            ("rom_version", d.rom_version.clone()),
            ("resolution", d.resolution.clone()),
            ("dpi", d.dpi.clone()),
            ("host_abi", d.host_abi.clone()),
            ("os_version", d.os_version.clone()),
            ("os_api", d.os_api.clone()),
        ]
    }

    /// Signed GET using the currently active device.
    pub async fn get(
        &self,
        base: &str,
        path: &str,
        params: &[(&str, String)],
        kind: HeaderKind,
    ) -> Result<UpstreamResponse> {
        let device = self.devices.snapshot();
        self.get_with_device(&device, base, path, params, kind).await
    }

    /// Signed GET pinned to a specific device snapshot, so a multi-step flow
    /// keeps one identity even if a rotation lands mid-flow.
    pub async fn get_with_device(
        &self,
        device: &DeviceProfile,
        base: &str,
        path: &str,
        params: &[(&str, String)],
        kind: HeaderKind,
    ) -> Result<UpstreamResponse> {
        let mut url = Url::parse(base)
            .and_then(|u| u.join(path))
            .map_err(|e| ApiError::Transport(format!("invalid url {base}{path}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in params {
                pairs.append_pair(name, value);
            }
        }

        let headers = match kind {
            HeaderKind::Common => self.common_headers(device),
            HeaderKind::Search => self.search_headers(device),
        };

        self.limiter.acquire().await;
        let signed = self.signer.sign_headers(url.as_str(), &headers).await?;

        // signed headers first so the baseline set wins on collisions
        let mut wire = HeaderMap::new();
        for (name, value) in signed.iter().chain(headers.iter()) {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    wire.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid header"),
            }
        }

        metrics::counter!(UPSTREAM_CALLS.name).increment(1);
        debug!(%url, kind = ?kind, device = device.label(), "upstream request");

        let response = self.http.get(url).headers(wire).send().await?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let bytes = response.bytes().await?;
        let body = decode_body(&response_headers, &bytes);
        Ok(UpstreamResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

/// Body decoding: honor the content-encoding header, but also sniff the gzip
/// magic since the upstream sometimes compresses without declaring it.
fn decode_body(headers: &HeaderMap, bytes: &[u8]) -> String {
    let declared_gzip = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);
    let magic_gzip = bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b;

    if declared_gzip || magic_gzip {
        let mut decoder = GzDecoder::new(bytes);
        let mut text = String::new();
        if decoder.read_to_string(&mut text).is_ok() {
            return text;
        }
        debug!("gzip decode failed, falling back to raw body");
    }
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_decode_body_gzip_magic_without_header() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"code\":0}").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body(&HeaderMap::new(), &compressed);
        assert_eq!(decoded, "{\"code\":0}");
    }

    #[test]
    fn test_decode_body_plain_passthrough() {
        let decoded = decode_body(&HeaderMap::new(), b"plain text");
        assert_eq!(decoded, "plain text");
    }

    #[test]
    fn test_decode_body_corrupt_gzip_falls_back() {
        // gzip magic with a truncated stream
        let decoded = decode_body(&HeaderMap::new(), &[0x1f, 0x8b, 0x00]);
        assert_eq!(decoded.as_bytes()[..2], [0x1f, 0x8b]);
    }

    #[test]
    fn test_business_error() {
        let ok: serde_json::Value = serde_json::json!({"code": 0, "data": {}});
        assert!(business_error(&ok).is_none());

        let err: serde_json::Value = serde_json::json!({"code": 110, "message": "risk"});
        match business_error(&err).unwrap() {
            ApiError::Upstream { code, message } => {
                assert_eq!(code, 110);
                assert_eq!(message, "risk");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let bare: serde_json::Value = serde_json::json!({"code": 7});
        match business_error(&bare).unwrap() {
            ApiError::Upstream { message, .. } => assert_eq!(message, "upstream error"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
