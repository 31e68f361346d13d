use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use std::time::Duration;
use upstream::errors::{ApiError, Result};
use upstream::signing::SigningOracle;

#[derive(Serialize)]
struct SignPayload<'a> {
    url: &'a str,
    /// Header order matters to the signature, so headers travel as a list.
    headers: Vec<(&'a str, &'a str)>,
}

/// Signing oracle reached over HTTP. The oracle's response body is its raw
/// output; format normalization happens in the signing client.
pub struct HttpOracle {
    http: reqwest::Client,
    url: String,
}

impl HttpOracle {
    pub fn new(url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ApiError::SigningFailed(format!("oracle client init: {e}")))?;
        Ok(HttpOracle { http, url })
    }
}

#[async_trait]
impl SigningOracle for HttpOracle {
    async fn sign(&self, url: &str, headers: &IndexMap<String, String>) -> Result<String> {
        let payload = SignPayload {
            url,
            headers: headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect(),
        };
        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::SigningFailed(format!("oracle request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ApiError::SigningFailed(format!(
                "oracle answered {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| ApiError::SigningFailed(format!("oracle response unreadable: {e}")))
    }
}
