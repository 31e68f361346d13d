use crate::client::{ApiClient, HeaderKind, business_error};
use crate::config::FetchConfig;
use crate::errors::{ApiError, Result};
use crate::restart::Supervisor;
use crate::rotation::{DeviceRotator, is_risk_message};
use crate::signing::snippet;
use crate::types::{BookItem, DirectoryItem, DirectoryResult, SearchResult};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SEARCH_PATH: &str = "/reading/bookapi/search/tab/v";
const DIRECTORY_PATH: &str = "/reading/bookapi/directory/all_items/v";

/// Parameters for one search call. Callers usually set only `query` and the
/// paging fields; the coordinator fills in the session bookkeeping.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub query: String,
    pub offset: u32,
    pub count: u32,
    pub tab_type: i64,
    pub passback: Option<u32>,
    /// Session id from a previous page; presence skips the priming phase.
    pub search_id: Option<String>,
    pub client_ab_info: Option<String>,
    pub last_search_page_interval: u64,
    pub is_first_enter_search: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        SearchRequest {
            query: String::new(),
            offset: 0,
            count: 10,
            tab_type: 1,
            passback: None,
            search_id: None,
            client_ab_info: None,
            last_search_page_interval: 0,
            is_first_enter_search: false,
        }
    }
}

/// Runs the two-phase search protocol and the directory endpoint.
///
/// A fresh search first primes a session (phase one), waits a human-looking
/// pause, then fetches results under the returned `search_id` (phase two).
/// When phase one yields no session id the coordinator retries, escalating
/// through forced device rotations before giving up.
pub struct SearchCoordinator {
    client: Arc<ApiClient>,
    rotator: Arc<DeviceRotator>,
    supervisor: Arc<Supervisor>,
    fetch: FetchConfig,
    pool_len: usize,
}

impl SearchCoordinator {
    pub fn new(
        client: Arc<ApiClient>,
        rotator: Arc<DeviceRotator>,
        supervisor: Arc<Supervisor>,
        fetch: FetchConfig,
        pool_len: usize,
    ) -> Self {
        SearchCoordinator {
            client,
            rotator,
            supervisor,
            fetch,
            pool_len,
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResult> {
        let mut request = request;
        if request.passback.is_none() {
            request.passback = Some(request.offset);
        }

        // continuation of an existing session goes straight to the results
        if let Some(search_id) = request.search_id.clone().filter(|id| !id.is_empty()) {
            let mut attempt = request.clone();
            attempt.is_first_enter_search = false;
            attempt.client_ab_info = None;
            return match self.perform(&attempt, false).await {
                Ok(mut result) => {
                    if result.search_id.is_empty() {
                        result.search_id = search_id;
                    }
                    self.supervisor.record_success();
                    Ok(result)
                }
                Err(err) => {
                    self.supervisor.record_failure("SEARCH_WITH_ID_FAIL");
                    Err(err)
                }
            };
        }

        let mut phase1 = request.clone();
        phase1.search_id = None;
        phase1.is_first_enter_search = true;
        phase1.last_search_page_interval = 0;

        let mut primed = match self.perform(&phase1, true).await {
            Ok(result) => result,
            Err(err) => {
                let risk = matches!(&err, ApiError::Upstream { message, .. } if is_risk_message(message));
                if risk && self.rotator.rotate("SEARCH_PHASE1_FAIL").await.is_some() {
                    match self.perform(&phase1, true).await {
                        Ok(result) => result,
                        Err(err) => {
                            self.supervisor.record_failure("SEARCH_PHASE1_FAIL");
                            return Err(err);
                        }
                    }
                } else {
                    self.supervisor.record_failure("SEARCH_PHASE1_FAIL");
                    return Err(err);
                }
            }
        };

        if primed.search_id.is_empty() && primed.books.is_empty() {
            match self.recover_search_id(&phase1).await? {
                Recovery::Primed(result) => primed = result,
                Recovery::Usable(result) => {
                    self.supervisor.record_success();
                    return Ok(result);
                }
            }
        }

        if primed.search_id.is_empty() {
            // results without a session id are still served; pagination will
            // simply start a fresh session on the next page
            self.supervisor.record_success();
            return Ok(primed);
        }

        let gap_ms = rand::thread_rng().gen_range(1000..=2000);
        tokio::time::sleep(Duration::from_millis(gap_ms)).await;

        let mut phase2 = request.clone();
        phase2.search_id = Some(primed.search_id.clone());
        phase2.is_first_enter_search = false;
        phase2.client_ab_info = None;
        phase2.last_search_page_interval = gap_ms;

        match self.perform(&phase2, false).await {
            Ok(mut result) => {
                if result.search_id.is_empty() {
                    result.search_id = primed.search_id;
                }
                self.supervisor.record_success();
                Ok(result)
            }
            Err(err) => {
                self.supervisor.record_failure("SEARCH_PHASE2_FAIL");
                Err(err)
            }
        }
    }

    /// Phase-one retry ladder: a couple of retries per device, then a forced
    /// rotation, until the pool is exhausted. The caller's priming call is
    /// the first attempt of the budget; the ladder only re-issues from the
    /// second one onward.
    async fn recover_search_id(&self, phase1: &SearchRequest) -> Result<Recovery> {
        let per_device = self.fetch.max_retries.clamp(1, 2);
        for device_attempt in 0..self.pool_len.max(1) as u32 {
            if device_attempt > 0
                && self
                    .rotator
                    .force_rotate("SEARCH_NO_SEARCH_ID")
                    .await
                    .is_none()
            {
                break;
            }
            for retry in 0..per_device {
                let overall = device_attempt * per_device + retry + 1;
                if overall == 1 {
                    // already performed and found unusable by the caller
                    continue;
                }
                tokio::time::sleep(self.backoff_delay(overall - 1)).await;
                match self.perform(phase1, true).await {
                    Ok(result) if !result.search_id.is_empty() => {
                        return Ok(Recovery::Primed(result));
                    }
                    Ok(result) if !result.books.is_empty() => {
                        return Ok(Recovery::Usable(result));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(attempt = overall, error = %err, "search id recovery attempt failed");
                    }
                }
            }
        }
        self.supervisor.record_failure("SEARCH_NO_SEARCH_ID");
        Err(ApiError::MissingSearchId)
    }

    /// Exponential backoff with jitter, clamped to the configured maximum.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.fetch.retry_delay_ms.max(1);
        let max = self.fetch.retry_max_delay_ms.max(base);
        let shift = attempt.saturating_sub(1).min(16);
        let delay = base.saturating_mul(1u64 << shift).min(max);
        let jitter = rand::thread_rng().gen_range(150..450);
        Duration::from_millis(delay.saturating_add(jitter).min(max))
    }

    /// Trivial search used by the startup probe; true when the device got a
    /// usable answer.
    pub async fn probe(&self) -> Result<bool> {
        let request = SearchRequest {
            query: "test".into(),
            is_first_enter_search: true,
            ..SearchRequest::default()
        };
        let result = self.perform(&request, true).await?;
        Ok(!result.search_id.is_empty() || !result.books.is_empty())
    }

    async fn perform(&self, request: &SearchRequest, first_phase: bool) -> Result<SearchResult> {
        let device = self.client.device_snapshot();
        let mut params: Vec<(&str, String)> = vec![
            ("query", request.query.clone()),
            ("offset", request.offset.to_string()),
            ("count", request.count.to_string()),
            ("tab_type", request.tab_type.to_string()),
            (
                "passback",
                request.passback.unwrap_or(request.offset).to_string(),
            ),
            (
                "is_first_enter_search",
                request.is_first_enter_search.to_string(),
            ),
            (
                "last_search_page_interval",
                request.last_search_page_interval.to_string(),
            ),
        ];
        if let Some(id) = request.search_id.as_deref().filter(|id| !id.is_empty()) {
            params.push(("search_id", id.to_string()));
        }
        if first_phase {
            if let Some(ab_info) = &request.client_ab_info {
                params.push(("client_ab_info", ab_info.clone()));
            }
        }
        params.extend(self.client.device_params(&device));

        let response = self
            .client
            .get_with_device(
                &device,
                self.client.search_base(),
                SEARCH_PATH,
                &params,
                HeaderKind::Search,
            )
            .await?;
        let json = response.json()?;
        if let Some(err) = business_error(&json) {
            return Err(err);
        }

        let mut result = parse_search_response(&json, request.tab_type);
        if result.search_id.is_empty() {
            if let Some(id) = deep_find_search_id(&json) {
                result.search_id = id;
            }
        }
        if result.search_id.is_empty() {
            for name in ["search_id", "search-id", "x-search-id", "x-fq-search-id"] {
                if let Some(value) = response.header(name).filter(|v| !v.is_empty()) {
                    result.search_id = value.to_string();
                    break;
                }
            }
        }
        if first_phase && result.search_id.is_empty() {
            debug!(
                body = snippet(&response.body, 1200),
                "priming response carried no search id"
            );
        }
        Ok(result)
    }

    /// Full chapter directory of a book, annotated with 1-based indexes and
    /// a latest-chapter marker.
    pub async fn directory(&self, book_id: &str) -> Result<DirectoryResult> {
        let device = self.client.device_snapshot();
        let mut params: Vec<(&str, String)> = vec![
            ("book_id", book_id.to_string()),
            ("book_type", "0".to_string()),
            ("need_version", "true".to_string()),
        ];
        params.extend(self.client.device_params(&device));

        let response = self
            .client
            .get_with_device(
                &device,
                self.client.base_url(),
                DIRECTORY_PATH,
                &params,
                HeaderKind::Common,
            )
            .await?;
        let json = response.json()?;
        if let Some(err) = business_error(&json) {
            debug!(book_id, body = snippet(&response.body, 1200), "directory request rejected");
            return Err(err);
        }
        let data = json
            .get("data")
            .filter(|d| !d.is_null())
            .ok_or_else(|| ApiError::InvalidResponse("directory response missing data".into()))?;

        let raw_items: Vec<RawDirectoryItem> = data
            .get("item_data_list")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ApiError::InvalidResponse(format!("directory item list: {e}")))?
            .unwrap_or_default();

        let len = raw_items.len();
        let items = raw_items
            .into_iter()
            .enumerate()
            .map(|(i, raw)| DirectoryItem {
                item_id: raw.item_id,
                title: raw.title,
                volume_name: raw.volume_name,
                chapter_word_number: raw.chapter_word_number,
                first_pass_time: raw.first_pass_time,
                chapter_index: i + 1,
                is_latest: i + 1 == len,
            })
            .collect();

        let serial_count = data
            .get("serial_count")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(DirectoryResult {
            items,
            serial_count,
        })
    }
}

enum Recovery {
    /// A session id was recovered; continue with phase two.
    Primed(SearchResult),
    /// No session id, but results exist; serve them as-is.
    Usable(SearchResult),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDirectoryItem {
    item_id: String,
    title: String,
    volume_name: String,
    chapter_word_number: u64,
    first_pass_time: i64,
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| value.get(*name).and_then(|v| v.as_str()))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

const SEARCH_ID_KEYS: &[&str] = &["search_id", "searchId", "search_id_str"];

/// Picks the tab matching `tab_type` (or the first one) out of the response
/// and flattens its book entries.
fn parse_search_response(json: &Value, tab_type: i64) -> SearchResult {
    let tabs = json
        .get("search_tabs")
        .or_else(|| json.get("searchTabs"))
        .or_else(|| json.get("data").and_then(|d| d.get("search_tabs")))
        .or_else(|| json.get("data").and_then(|d| d.get("searchTabs")))
        .and_then(|v| v.as_array());
    let tab = tabs.and_then(|tabs| {
        tabs.iter()
            .find(|t| t.get("tab_type").and_then(|v| v.as_i64()) == Some(tab_type))
            .or_else(|| tabs.first())
    });

    let mut books = Vec::new();
    if let Some(entries) = tab
        .and_then(|t| t.get("data"))
        .and_then(|v| v.as_array())
    {
        for entry in entries {
            let Some(book_data) = entry.get("book_data").and_then(|v| v.as_array()) else {
                continue;
            };
            for book in book_data {
                match serde_json::from_value::<BookItem>(book.clone()) {
                    Ok(book) => books.push(book),
                    Err(e) => debug!(error = %e, "skipping unparseable book entry"),
                }
            }
        }
    }

    let total = tab
        .and_then(|t| t.get("total"))
        .and_then(|v| v.as_i64())
        .unwrap_or(books.len() as i64);
    let has_more = tab
        .and_then(|t| t.get("has_more"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let search_id = tab
        .and_then(|t| string_field(t, SEARCH_ID_KEYS))
        .or_else(|| json.get("data").and_then(|d| string_field(d, SEARCH_ID_KEYS)))
        .or_else(|| string_field(json, SEARCH_ID_KEYS))
        .unwrap_or_default();

    SearchResult {
        books,
        total,
        has_more,
        search_id,
    }
}

/// Last resort: walk the whole response tree for any search-id field.
fn deep_find_search_id(json: &Value) -> Option<String> {
    let mut stack = vec![json];
    while let Some(value) = stack.pop() {
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    if SEARCH_ID_KEYS.contains(&key.as_str()) {
                        if let Some(s) = value.as_str().filter(|s| !s.is_empty()) {
                            return Some(s.to_string());
                        }
                    }
                    stack.push(value);
                }
            }
            Value::Array(items) => stack.extend(items),
            _ => {}
        }
    }
    None
}
