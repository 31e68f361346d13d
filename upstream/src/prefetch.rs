use crate::cache::TimedCache;
use crate::client::{ApiClient, HeaderKind, business_error};
use crate::config::FetchConfig;
use crate::errors::{ApiError, Result};
use crate::keys::KeyRegistry;
use crate::metrics_defs::{
    CHAPTER_CACHE_HIT, CHAPTER_CACHE_MISS, DIRECTORY_CACHE_HIT, DIRECTORY_CACHE_MISS,
};
use crate::search::SearchCoordinator;
use crate::single_flight::SingleFlight;
use crate::types::{BatchItem, ChapterContent, now_ms};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

const BATCH_PATH: &str = "/reading/reader/batch_full/v";
const MAX_PREFETCH: usize = 30;

/// Decrypts chapter payloads with a registered key.
pub trait ContentCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str, key: &str) -> Result<String>;
}

static BLK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<blk[^>]*>([^<]*)</blk>").unwrap());
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static H1_BLK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h1[^>]*>.*?<blk[^>]*>([^<]*)</blk>.*?</h1>").unwrap());

/// Serves chapters from cache, fetching whole directory-aligned buckets on a
/// miss so sequential reading mostly hits the cache.
///
/// Concurrent misses in the same bucket coalesce into one batch fetch; a
/// chapter absent from the directory degrades to a single-chapter fetch.
pub struct ChapterPrefetcher {
    client: Arc<ApiClient>,
    search: Arc<SearchCoordinator>,
    keys: Arc<KeyRegistry>,
    cipher: Arc<dyn ContentCipher>,
    chapters: TimedCache<Arc<ChapterContent>>,
    directories: TimedCache<Arc<Vec<String>>>,
    chapter_flight: SingleFlight<String, ()>,
    directory_flight: SingleFlight<String, Arc<Vec<String>>>,
    prefetch_size: usize,
}

impl ChapterPrefetcher {
    pub fn new(
        client: Arc<ApiClient>,
        search: Arc<SearchCoordinator>,
        keys: Arc<KeyRegistry>,
        cipher: Arc<dyn ContentCipher>,
        fetch: &FetchConfig,
    ) -> Self {
        let directory_capacity = (fetch.chapter_cache_max_entries / 10).max(64);
        ChapterPrefetcher {
            client,
            search,
            keys,
            cipher,
            chapters: TimedCache::new(
                fetch.chapter_cache_max_entries,
                fetch.chapter_cache_ttl_ms,
                CHAPTER_CACHE_HIT,
                CHAPTER_CACHE_MISS,
            ),
            directories: TimedCache::new(
                directory_capacity,
                fetch.directory_cache_ttl_ms,
                DIRECTORY_CACHE_HIT,
                DIRECTORY_CACHE_MISS,
            ),
            chapter_flight: SingleFlight::new(),
            directory_flight: SingleFlight::new(),
            prefetch_size: fetch.chapter_prefetch_size.clamp(1, MAX_PREFETCH),
        }
    }

    pub async fn get_chapter(
        self: &Arc<Self>,
        book_id: &str,
        chapter_id: &str,
    ) -> Result<Arc<ChapterContent>> {
        let cache_key = chapter_key(book_id, chapter_id);
        if let Some(chapter) = self.chapters.get(&cache_key) {
            return Ok(chapter);
        }

        let flight_key = self.flight_key(book_id, chapter_id).await;
        let this = Arc::clone(self);
        let book = book_id.to_string();
        let chapter = chapter_id.to_string();
        // errors surface through the fallback below, after the cache re-check
        let _ = self
            .chapter_flight
            .run(flight_key, async move { this.prefetch_bucket(book, chapter).await })
            .await;

        if let Some(chapter) = self.chapters.get(&cache_key) {
            return Ok(chapter);
        }

        // the bucket fetch failed or skipped this chapter; try it alone
        let items = self.batch_full(book_id, &[chapter_id.to_string()]).await?;
        let item = items
            .get(chapter_id)
            .or_else(|| items.values().next())
            .ok_or_else(|| ApiError::InvalidResponse("batch response carried no chapters".into()))?;
        let content = Arc::new(self.build_chapter(book_id, chapter_id, item).await?);
        self.chapters.insert(cache_key, Arc::clone(&content));
        Ok(content)
    }

    /// Flight key for the miss: the chapter's directory bucket, or a
    /// chapter-scoped key when the directory does not know the chapter.
    async fn flight_key(self: &Arc<Self>, book_id: &str, chapter_id: &str) -> String {
        let ids = self.directory_ids(book_id).await;
        match ids.iter().position(|id| id == chapter_id) {
            Some(index) => {
                let start = bucket_start(index, self.prefetch_size);
                format!("{book_id}:bucket:{start}:{}", self.prefetch_size)
            }
            None => format!("{book_id}:single:{chapter_id}"),
        }
    }

    async fn prefetch_bucket(self: Arc<Self>, book_id: String, chapter_id: String) -> Result<()> {
        let ids = self.directory_ids(&book_id).await;
        let batch_ids: Vec<String> = match ids.iter().position(|id| *id == chapter_id) {
            Some(index) => {
                let start = bucket_start(index, self.prefetch_size);
                let end = (start + self.prefetch_size).min(ids.len());
                ids[start..end].to_vec()
            }
            None => vec![chapter_id.clone()],
        };

        let items = self.batch_full(&book_id, &batch_ids).await?;
        for (id, item) in &items {
            match self.build_chapter(&book_id, id, item).await {
                Ok(content) => {
                    self.chapters.insert(chapter_key(&book_id, id), Arc::new(content));
                }
                // one broken chapter must not fail the whole bucket
                Err(err) => debug!(book_id = %book_id, chapter = %id, error = %err, "chapter decode failed"),
            }
        }
        Ok(())
    }

    /// Ordered chapter ids of a book, empty when the directory is
    /// unavailable. Concurrent fetches per book coalesce.
    async fn directory_ids(self: &Arc<Self>, book_id: &str) -> Arc<Vec<String>> {
        if let Some(ids) = self.directories.get(book_id) {
            if !ids.is_empty() {
                return ids;
            }
        }
        let this = Arc::clone(self);
        let book = book_id.to_string();
        self.directory_flight
            .run(book_id.to_string(), async move {
                match this.search.directory(&book).await {
                    Ok(result) => {
                        let ids: Vec<String> = result
                            .items
                            .iter()
                            .map(|item| item.item_id.trim().to_string())
                            .filter(|id| !id.is_empty())
                            .collect();
                        let ids = Arc::new(ids);
                        if !ids.is_empty() {
                            this.directories.insert(book, Arc::clone(&ids));
                        }
                        Ok(ids)
                    }
                    Err(err) => {
                        debug!(book_id = %book, error = %err, "directory fetch failed");
                        Ok(Arc::new(Vec::new()))
                    }
                }
            })
            .await
            .unwrap_or_else(|_| Arc::new(Vec::new()))
    }

    async fn batch_full(
        &self,
        book_id: &str,
        item_ids: &[String],
    ) -> Result<HashMap<String, BatchItem>> {
        let device = self.client.device_snapshot();
        let mut params: Vec<(&str, String)> = vec![
            ("item_ids", item_ids.join(",")),
            ("book_id", book_id.to_string()),
            ("download", "true".to_string()),
        ];
        params.extend(self.client.device_params(&device));

        let response = self
            .client
            .get_with_device(
                &device,
                self.client.base_url(),
                BATCH_PATH,
                &params,
                HeaderKind::Common,
            )
            .await?;
        let json = response.json()?;
        if let Some(err) = business_error(&json) {
            return Err(err);
        }
        let data = json
            .get("data")
            .and_then(|d| d.get("data"))
            .cloned()
            .ok_or_else(|| ApiError::InvalidResponse("batch response missing data".into()))?;
        serde_json::from_value(data)
            .map_err(|e| ApiError::InvalidResponse(format!("batch chapter map: {e}")))
    }

    async fn build_chapter(
        &self,
        book_id: &str,
        chapter_id: &str,
        item: &BatchItem,
    ) -> Result<ChapterContent> {
        let key = self.keys.get_key(item.key_version).await?;
        let html = self.cipher.decrypt(&item.content, &key)?;
        let plain_text = extract_text(&html);
        let title = if item.title.is_empty() {
            extract_title(&html).unwrap_or_else(|| "untitled".into())
        } else {
            item.title.clone()
        };
        let author_name = item
            .novel_data
            .as_ref()
            .map(|n| n.author.clone())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "unknown".into());
        Ok(ChapterContent {
            book_id: book_id.to_string(),
            chapter_id: chapter_id.to_string(),
            word_count: plain_text.chars().count() as u64,
            raw_html: html,
            plain_text,
            title,
            author_name,
            updated_at_ms: now_ms(),
        })
    }

    #[cfg(test)]
    pub fn cached_chapter_count(&self) -> u64 {
        self.chapters.len()
    }

    #[cfg(test)]
    pub fn seed_chapter(&self, chapter: ChapterContent) {
        let key = chapter_key(&chapter.book_id, &chapter.chapter_id);
        self.chapters.insert(key, Arc::new(chapter));
    }
}

fn chapter_key(book_id: &str, chapter_id: &str) -> String {
    format!("{book_id}:{chapter_id}")
}

fn bucket_start(index: usize, size: usize) -> usize {
    (index / size) * size
}

/// Paragraph text from decrypted chapter markup: the `<blk>` runs joined by
/// newlines, or a bare tag strip when no `<blk>` exists.
fn extract_text(html: &str) -> String {
    let paragraphs: Vec<&str> = BLK
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect();
    if !paragraphs.is_empty() {
        return paragraphs.join("\n");
    }
    TAG.replace_all(html, "").trim().to_string()
}

fn extract_title(html: &str) -> Option<String> {
    H1_BLK
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}
