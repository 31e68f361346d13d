//! Shared fixtures for the crate's tests: a scriptable mock upstream and a
//! fully wired component stack pointed at it.

use crate::client::ApiClient;
use crate::config::{ApiConfig, FetchConfig};
use crate::device::{Device, DeviceProfile, DeviceState};
use crate::errors::Result;
use crate::keys::KeyRegistry;
use crate::prefetch::{ChapterPrefetcher, ContentCipher};
use crate::restart::Supervisor;
use crate::rotation::DeviceRotator;
use crate::search::SearchCoordinator;
use crate::signing::{SignatureClient, SigningOracle};
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use flate2::Compression;
use flate2::write::GzEncoder;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path: String,
    pub params: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn json(value: serde_json::Value) -> Self {
        MockResponse {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: value.to_string().into_bytes(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn gzipped(mut self) -> Self {
        self.body = gzip(&self.body);
        self
    }
}

#[derive(Default)]
struct MockState {
    requests: Vec<RecordedRequest>,
    scripts: HashMap<String, VecDeque<MockResponse>>,
}

/// In-process upstream double. Responses are scripted per path suffix and
/// consumed in order; the last one sticks so a single script can serve any
/// number of calls.
pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(MockState::default()));
        let app = Router::new().fallback(handle).with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockUpstream { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn enqueue(&self, path_suffix: &str, response: MockResponse) {
        self.state
            .lock()
            .scripts
            .entry(path_suffix.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn enqueue_json(&self, path_suffix: &str, value: serde_json::Value) {
        self.enqueue(path_suffix, MockResponse::json(value));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn requests_for(&self, path_suffix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.ends_with(path_suffix))
            .collect()
    }
}

async fn handle(State(state): State<Arc<Mutex<MockState>>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let params: HashMap<String, String> = request
        .uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    let headers = request
        .headers()
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let scripted = {
        let mut state = state.lock();
        state.requests.push(RecordedRequest {
            path: path.clone(),
            params,
            headers,
        });
        let key = state
            .scripts
            .keys()
            .find(|suffix| path.ends_with(suffix.as_str()))
            .cloned();
        key.and_then(|key| {
            let queue = state.scripts.get_mut(&key).unwrap();
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        })
    };

    let scripted = scripted.unwrap_or_else(|| MockResponse {
        status: 404,
        headers: vec![("content-type".into(), "application/json".into())],
        body: br#"{"code":404,"message":"not scripted"}"#.to_vec(),
    });

    let mut builder = Response::builder().status(scripted.status);
    for (name, value) in &scripted.headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(scripted.body)).unwrap()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Oracle double returning a fixed raw output.
pub struct FixedOracle {
    output: Mutex<String>,
}

impl Default for FixedOracle {
    fn default() -> Self {
        FixedOracle {
            output: Mutex::new(r#"{"X-Argus":"sig","X-Khronos":"123"}"#.into()),
        }
    }
}

impl FixedOracle {
    pub fn set_output(&self, output: &str) {
        *self.output.lock() = output.to_string();
    }
}

#[async_trait]
impl SigningOracle for FixedOracle {
    async fn sign(&self, _url: &str, _headers: &IndexMap<String, String>) -> Result<String> {
        Ok(self.output.lock().clone())
    }
}

/// Identity cipher; mock chapter bodies are served unencrypted.
pub struct PlainCipher;

impl ContentCipher for PlainCipher {
    fn decrypt(&self, ciphertext: &str, _key: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

pub fn test_profile(name: &str, device_id: &str, install_id: &str) -> DeviceProfile {
    DeviceProfile {
        name: Some(name.into()),
        user_agent: format!("test-agent/{name}"),
        cookie: format!("session={name}"),
        device: Device {
            device_id: device_id.into(),
            install_id: install_id.into(),
            ..Device::default()
        },
    }
}

pub struct TestStack {
    pub mock: MockUpstream,
    pub devices: Arc<DeviceState>,
    pub client: Arc<ApiClient>,
    pub keys: Arc<KeyRegistry>,
    pub rotator: Arc<DeviceRotator>,
    pub supervisor: Arc<Supervisor>,
    pub shutdown_rx: mpsc::Receiver<String>,
    pub search: Arc<SearchCoordinator>,
    pub prefetcher: Arc<ChapterPrefetcher>,
}

pub async fn stack() -> TestStack {
    stack_with(|_, _| {}).await
}

/// Wires the full component stack against a fresh mock upstream. The tweak
/// closure runs after test defaults are applied.
pub async fn stack_with(tweak: impl FnOnce(&mut ApiConfig, &mut FetchConfig)) -> TestStack {
    let mock = MockUpstream::start().await;

    let mut api = ApiConfig {
        base_url: mock.base_url(),
        device_pool: vec![
            test_profile("dev-a", "d-100", "i-100"),
            test_profile("dev-b", "d-200", "i-200"),
            test_profile("dev-c", "d-300", "i-300"),
        ],
        device_pool_shuffle_on_startup: false,
        device_rotate_cooldown_ms: 0,
        ..ApiConfig::default()
    };
    let mut fetch = FetchConfig {
        request_interval_ms: 0,
        retry_delay_ms: 10,
        retry_max_delay_ms: 50,
        auto_restart_force_halt_after_ms: 0,
        ..FetchConfig::default()
    };
    tweak(&mut api, &mut fetch);

    let devices = Arc::new(DeviceState::from_config(&api).unwrap());
    let signer = SignatureClient::new(Arc::new(FixedOracle::default()));
    let client = Arc::new(ApiClient::new(api.clone(), &fetch, Arc::clone(&devices), signer).unwrap());
    let keys = Arc::new(KeyRegistry::new(Arc::clone(&client)));
    let rotator = Arc::new(DeviceRotator::new(
        Arc::clone(&devices),
        Arc::clone(&keys),
        &api,
    ));
    let (supervisor, shutdown_rx) = Supervisor::new(&fetch);
    let search = Arc::new(SearchCoordinator::new(
        Arc::clone(&client),
        Arc::clone(&rotator),
        Arc::clone(&supervisor),
        fetch.clone(),
        devices.pool_len(),
    ));
    let prefetcher = Arc::new(ChapterPrefetcher::new(
        Arc::clone(&client),
        Arc::clone(&search),
        Arc::clone(&keys),
        Arc::new(PlainCipher),
        &fetch,
    ));

    TestStack {
        mock,
        devices,
        client,
        keys,
        rotator,
        supervisor,
        shutdown_rx,
        search,
        prefetcher,
    }
}
