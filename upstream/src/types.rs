use crate::errors::ApiError;
use serde::{Deserialize, Serialize};

/// Response envelope shared by every endpoint: `{code, message, data}`.
#[derive(Clone, Debug, Serialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn success(data: T) -> Self {
        ApiEnvelope {
            code: 0,
            message: "success".into(),
            data: Some(data),
        }
    }

    pub fn failure(err: &ApiError) -> Self {
        ApiEnvelope {
            code: err.code(),
            message: err.to_string(),
            data: None,
        }
    }
}

/// A book as returned by the search endpoint. The upstream carries dozens of
/// fields; only the ones the façade serves are mapped.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BookItem {
    pub book_id: String,
    pub book_name: String,
    pub author: String,
    #[serde(rename = "abstract")]
    pub description: String,
    #[serde(rename = "thumb_url")]
    pub cover_url: String,
    pub category: String,
    pub creation_status: String,
    #[serde(rename = "word_number")]
    pub word_count: u64,
    pub score: f64,
    pub serial_count: String,
    pub last_chapter_title: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SearchResult {
    pub books: Vec<BookItem>,
    pub total: i64,
    pub has_more: bool,
    pub search_id: String,
}

/// One chapter entry from the directory listing, annotated with its 1-based
/// position and a marker on the newest chapter.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DirectoryItem {
    pub item_id: String,
    pub title: String,
    pub volume_name: String,
    pub chapter_word_number: u64,
    pub first_pass_time: i64,
    pub chapter_index: usize,
    pub is_latest: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DirectoryResult {
    pub items: Vec<DirectoryItem>,
    pub serial_count: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NovelData {
    pub author: String,
}

/// One encrypted chapter from a `batch_full` response.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BatchItem {
    pub content: String,
    pub title: String,
    pub key_version: i64,
    pub novel_data: Option<NovelData>,
}

/// A decrypted, cache-ready chapter.
#[derive(Clone, Debug, Serialize)]
pub struct ChapterContent {
    pub book_id: String,
    pub chapter_id: String,
    pub raw_html: String,
    pub plain_text: String,
    pub title: String,
    pub author_name: String,
    pub word_count: u64,
    pub updated_at_ms: u64,
}

pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_item_from_upstream_json() {
        let json = serde_json::json!({
            "book_id": "7100000001",
            "book_name": "Example",
            "author": "Someone",
            "abstract": "A short blurb",
            "thumb_url": "https://img.example/cover.png",
            "word_number": 120_000,
            "serial_count": "512",
            "ignored_field": "dropped"
        });
        let book: BookItem = serde_json::from_value(json).unwrap();
        assert_eq!(book.book_id, "7100000001");
        assert_eq!(book.description, "A short blurb");
        assert_eq!(book.cover_url, "https://img.example/cover.png");
        assert_eq!(book.word_count, 120_000);
        // missing fields default
        assert_eq!(book.category, "");
    }

    #[test]
    fn test_envelope_failure_keeps_upstream_code() {
        let env: ApiEnvelope<()> = ApiEnvelope::failure(&ApiError::Upstream {
            code: 110,
            message: "risk".into(),
        });
        assert_eq!(env.code, 110);
        assert!(env.data.is_none());
    }
}
