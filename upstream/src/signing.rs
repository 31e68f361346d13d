use crate::errors::{ApiError, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::warn;

/// External process that computes anti-tamper signatures for a request.
///
/// The oracle receives the full URL and the headers that will be sent, and
/// returns its raw textual output; parsing is this module's job.
#[async_trait]
pub trait SigningOracle: Send + Sync {
    async fn sign(&self, url: &str, headers: &IndexMap<String, String>) -> Result<String>;
}

static COLON_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}:\s*.+$").unwrap());

/// Invokes the oracle and normalizes its output into request headers.
#[derive(Clone)]
pub struct SignatureClient {
    oracle: Arc<dyn SigningOracle>,
}

impl SignatureClient {
    pub fn new(oracle: Arc<dyn SigningOracle>) -> Self {
        SignatureClient { oracle }
    }

    /// Signs a request and returns the headers to merge in, with transport
    /// artifacts stripped. Fails when the oracle errors or its output yields
    /// no headers at all.
    pub async fn sign_headers(
        &self,
        url: &str,
        headers: &IndexMap<String, String>,
    ) -> Result<IndexMap<String, String>> {
        let raw = self
            .oracle
            .sign(url, headers)
            .await
            .map_err(|err| ApiError::SigningFailed(err.to_string()))?;

        let mut signed = parse_oracle_output(&raw);
        signed.retain(|name, _| !name.eq_ignore_ascii_case("x-neptune"));

        if signed.is_empty() {
            return Err(ApiError::SigningFailed(
                "oracle returned no headers".into(),
            ));
        }
        let has_signature = signed
            .keys()
            .any(|name| name.eq_ignore_ascii_case("x-argus") || name.eq_ignore_ascii_case("x-gorgon"));
        if !has_signature {
            warn!(
                output = snippet(&raw, 200),
                "oracle output carries no x-argus/x-gorgon header"
            );
        }
        Ok(signed)
    }
}

/// Parses oracle output in any of the formats seen in the wild: a JSON
/// object, `Name: value` lines, alternating name/value lines, or `k=v`
/// lines. Unparseable lines are skipped.
fn parse_oracle_output(raw: &str) -> IndexMap<String, String> {
    let normalized = raw.replace("\r\n", "\n");
    let trimmed = normalized.trim();
    let mut headers = IndexMap::new();
    if trimmed.is_empty() {
        return headers;
    }

    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
            for (name, value) in map {
                if let Some(value) = value.as_str() {
                    headers.insert(name, value.to_string());
                }
            }
            return headers;
        }
    }

    let lines: Vec<&str> = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.iter().any(|line| COLON_PAIR.is_match(line)) {
        for line in &lines {
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                let value = value.trim();
                if !name.is_empty() && !value.is_empty() {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }
        return headers;
    }

    if lines.len() >= 2 && lines.len() % 2 == 0 {
        for pair in lines.chunks(2) {
            headers.insert(pair[0].to_string(), pair[1].to_string());
        }
        return headers;
    }

    for line in &lines {
        if let Some((name, value)) = line.split_once('=') {
            let name = name.trim();
            let value = value.trim();
            if !name.is_empty() && !value.is_empty() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }
    headers
}

pub(crate) fn snippet(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RawOracle(String);

    #[async_trait]
    impl SigningOracle for RawOracle {
        async fn sign(&self, _url: &str, _headers: &IndexMap<String, String>) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    async fn sign(raw: &str) -> Result<IndexMap<String, String>> {
        let client = SignatureClient::new(Arc::new(RawOracle(raw.into())));
        client.sign_headers("https://example.com/x", &IndexMap::new()).await
    }

    #[tokio::test]
    async fn test_json_object_output() {
        let signed = sign(r#"{"X-Argus":"abc","X-Khronos":"1700000000"}"#).await.unwrap();
        assert_eq!(signed.get("X-Argus").unwrap(), "abc");
        assert_eq!(signed.get("X-Khronos").unwrap(), "1700000000");
    }

    #[tokio::test]
    async fn test_colon_pair_output() {
        let signed = sign("X-Argus: abc\r\nX-Gorgon: 0404deadbeef\n").await.unwrap();
        assert_eq!(signed.get("X-Argus").unwrap(), "abc");
        assert_eq!(signed.get("X-Gorgon").unwrap(), "0404deadbeef");
    }

    #[tokio::test]
    async fn test_paired_line_output() {
        let signed = sign("X-Argus\nabc\nX-Khronos\n1700000000").await.unwrap();
        assert_eq!(signed.get("X-Argus").unwrap(), "abc");
        assert_eq!(signed.get("X-Khronos").unwrap(), "1700000000");
    }

    #[tokio::test]
    async fn test_key_value_fallback() {
        let signed = sign("X-Argus=abc").await.unwrap();
        assert_eq!(signed.get("X-Argus").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_x_neptune_stripped() {
        let signed = sign(r#"{"X-Argus":"abc","X-Neptune":"internal"}"#).await.unwrap();
        assert!(signed.keys().all(|k| !k.eq_ignore_ascii_case("x-neptune")));
        assert!(signed.contains_key("X-Argus"));
    }

    #[tokio::test]
    async fn test_empty_output_is_error() {
        let err = sign("   \n  ").await.unwrap_err();
        assert!(matches!(err, ApiError::SigningFailed(_)));
    }

    #[tokio::test]
    async fn test_oracle_error_maps_to_signing_failed() {
        struct FailOracle;
        #[async_trait]
        impl SigningOracle for FailOracle {
            async fn sign(&self, _: &str, _: &IndexMap<String, String>) -> Result<String> {
                Err(ApiError::Transport("connection refused".into()))
            }
        }
        let client = SignatureClient::new(Arc::new(FailOracle));
        let err = client
            .sign_headers("https://example.com/x", &IndexMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SigningFailed(_)));
    }

    #[test]
    fn test_snippet_truncates() {
        assert_eq!(snippet("short", 10), "short");
        assert_eq!(snippet("0123456789abcdef", 10), "0123456789...");
    }
}
