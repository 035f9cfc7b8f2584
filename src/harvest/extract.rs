//! Single-pass snapshot extraction.
//!
//! One [`scripts::snapshot`] request returns raw candidates for every
//! container on the page. This module turns them into [`FeedRecord`]s:
//! - field chains resolve to their first non-empty candidate
//! - media candidates from five independent strategies pass through
//!   [`MediaFilter`] into one ordered, deduplicated set
//! - records whose indicator count exceeds their media count get a second
//!   look through [`CarouselResolver`]

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{HarvestConfig, StrategyConfig};
use crate::harvest::carousel::CarouselResolver;
use crate::harvest::scripts;
use crate::model::{FeedRecord, MediaSet};
use crate::traits::{BrowserSession, SessionError};

// ============================================================================
// Raw snapshot payloads
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawFields {
    #[serde(default)]
    pub date: Vec<String>,
    #[serde(default)]
    pub time: Vec<String>,
    #[serde(default)]
    pub event_type: Vec<String>,
    #[serde(default)]
    pub content: Vec<String>,
}

/// Media candidates, one list per discovery strategy.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawMedia {
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub carousel: Vec<String>,
    #[serde(default)]
    pub styles: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub framework: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawContainer {
    #[serde(default)]
    ordinal: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    fields: RawFields,
    #[serde(default)]
    media: RawMedia,
    #[serde(default)]
    indicators: usize,
    #[serde(default)]
    error: Option<String>,
}

/// First candidate that is non-empty after trimming.
pub fn first_non_empty(candidates: &[String]) -> String {
    candidates
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
        .unwrap_or_default()
        .to_string()
}

// ============================================================================
// Media filter
// ============================================================================

fn style_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("static style pattern")
    })
}

fn text_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?:https?:)?//[^\s"'<>()\\,\]\}]+"#).expect("static url pattern")
    })
}

/// Accepts only absolute, non-vector media on the allow-listed host and
/// canonicalizes them by dropping query and fragment.
#[derive(Debug, Clone)]
pub struct MediaFilter {
    allowed_host: String,
}

impl MediaFilter {
    pub fn new(allowed_host: &str) -> Self {
        Self {
            allowed_host: allowed_host.trim().to_ascii_lowercase(),
        }
    }

    pub fn accept(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("data:") {
            return None;
        }
        let absolute = if raw.starts_with("//") {
            format!("https:{}", raw)
        } else {
            raw.to_string()
        };

        let mut url = Url::parse(&absolute).ok()?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return None;
        }
        let host = url.host_str()?.to_ascii_lowercase();
        if host != self.allowed_host {
            return None;
        }
        if url.path().to_ascii_lowercase().ends_with(".svg") {
            return None;
        }

        url.set_query(None);
        url.set_fragment(None);
        Some(url.to_string())
    }

    /// URLs inside `url(...)` of an inline style.
    pub fn from_style(&self, style: &str) -> Vec<String> {
        style_url_pattern()
            .captures_iter(style)
            .filter_map(|cap| cap.get(1))
            .filter_map(|m| self.accept(m.as_str()))
            .collect()
    }

    /// URLs embedded in script or JSON text, including JSON-escaped ones.
    pub fn from_text(&self, text: &str) -> Vec<String> {
        let unescaped = text.replace("\\/", "/").replace("\\u002F", "/");
        text_url_pattern()
            .find_iter(&unescaped)
            .filter_map(|m| self.accept(m.as_str()))
            .collect()
    }

    pub(crate) fn collect(&self, media: &RawMedia) -> MediaSet {
        let mut set = MediaSet::new();
        set.extend(media.attributes.iter().filter_map(|u| self.accept(u)));
        set.extend(media.carousel.iter().filter_map(|u| self.accept(u)));
        for style in &media.styles {
            set.extend(self.from_style(style));
        }
        for text in &media.scripts {
            set.extend(self.from_text(text));
        }
        set.extend(media.framework.iter().filter_map(|u| self.accept(u)));
        set
    }
}

// ============================================================================
// Extractor
// ============================================================================

/// Keeps the resolved carousel set only when it strictly improves on the
/// static one.
pub fn supersede(static_urls: Vec<String>, resolved: Vec<String>) -> Vec<String> {
    if resolved.len() > static_urls.len() {
        resolved
    } else {
        static_urls
    }
}

pub struct SnapshotExtractor {
    strategies: StrategyConfig,
    filter: MediaFilter,
    resolver: CarouselResolver,
}

impl SnapshotExtractor {
    pub fn new(config: &HarvestConfig) -> Self {
        let filter = MediaFilter::new(&config.feed.allowed_host);
        Self {
            strategies: config.strategies.clone(),
            resolver: CarouselResolver::new(
                config.strategies.clone(),
                filter.clone(),
                config.carousel.settle(),
            ),
            filter,
        }
    }

    /// Extracts one record per container in a single page request.
    ///
    /// Per-container faults come back as records with `extraction_failed`
    /// set; only a failure of the batched request itself is an `Err`.
    #[instrument(skip(self, session))]
    pub async fn extract<B>(
        &self,
        session: &B,
        container_selector: &str,
    ) -> Result<Vec<FeedRecord>, SessionError>
    where
        B: BrowserSession + ?Sized,
    {
        let value = session
            .query(scripts::snapshot(container_selector, &self.strategies))
            .await?;

        let items = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(SessionError::Protocol(format!(
                    "snapshot returned {} instead of an array",
                    json_kind(&other)
                )))
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut record = self.build_record(index, item);

            if !record.extraction_failed && record.carousel_expected > record.carousel_found {
                self.apply_carousel(session, container_selector, &mut record)
                    .await;
            }
            records.push(record);
        }

        debug!(count = records.len(), "Snapshot extracted");
        Ok(records)
    }

    fn build_record(&self, index: usize, item: Value) -> FeedRecord {
        let raw: RawContainer = match serde_json::from_value(item) {
            Ok(raw) => raw,
            Err(e) => {
                return FeedRecord::failed(index, &format!("malformed container payload: {}", e))
            }
        };

        let ordinal = raw.ordinal.unwrap_or(index);
        if let Some(error) = raw.error {
            warn!(ordinal, error = %error, "Container extraction failed");
            return FeedRecord::failed(ordinal, &error);
        }

        let identity = raw
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| FeedRecord::positional_identity(ordinal));

        let media_urls = self.filter.collect(&raw.media).into_vec();

        FeedRecord {
            identity,
            ordinal,
            date: first_non_empty(&raw.fields.date),
            time: first_non_empty(&raw.fields.time),
            event_type: first_non_empty(&raw.fields.event_type),
            content: first_non_empty(&raw.fields.content),
            carousel_expected: raw.indicators,
            carousel_found: media_urls.len(),
            media_urls,
            extraction_failed: false,
            error: None,
        }
    }

    async fn apply_carousel<B>(&self, session: &B, container_selector: &str, record: &mut FeedRecord)
    where
        B: BrowserSession + ?Sized,
    {
        match self
            .resolver
            .resolve(session, container_selector, record.ordinal)
            .await
        {
            Ok(resolved) => {
                let before = record.media_urls.len();
                let statics = std::mem::take(&mut record.media_urls);
                record.media_urls = supersede(statics, resolved);
                if record.media_urls.len() > before {
                    info!(
                        ordinal = record.ordinal,
                        expected = record.carousel_expected,
                        found = before,
                        resolved = record.media_urls.len(),
                        "Carousel resolved"
                    );
                }
            }
            Err(e) => {
                warn!(ordinal = record.ordinal, error = %e, "Carousel fallback failed");
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::sessions::memory::{MemoryContainer, MemorySession};
    use serde_json::json;

    const HOST: &str = "media.example.org";

    fn config() -> HarvestConfig {
        let mut config = HarvestConfig::default();
        config.feed.allowed_host = HOST.to_string();
        config.carousel.settle_ms = 1;
        config
    }

    fn url(name: &str) -> String {
        format!("https://{}/feed/{}", HOST, name)
    }

    #[test]
    fn test_first_non_empty_skips_blank_candidates() {
        let candidates = vec!["".to_string(), "   ".to_string(), " Monday ".to_string()];
        assert_eq!(first_non_empty(&candidates), "Monday");
        assert_eq!(first_non_empty(&[]), "");
    }

    #[test]
    fn test_media_filter_accepts_only_allow_listed_raster_urls() {
        let filter = MediaFilter::new(HOST);
        assert_eq!(
            filter.accept("https://media.example.org/a/pic.jpg?token=abc#x"),
            Some("https://media.example.org/a/pic.jpg".to_string())
        );
        assert_eq!(
            filter.accept("//MEDIA.example.org/a/pic.png"),
            Some("https://media.example.org/a/pic.png".to_string())
        );
        assert_eq!(filter.accept("https://cdn.other.net/pic.jpg"), None);
        assert_eq!(filter.accept("https://media.example.org/icon.SVG"), None);
        assert_eq!(filter.accept("data:image/png;base64,AAAA"), None);
        assert_eq!(filter.accept("/relative/pic.jpg"), None);
        assert_eq!(filter.accept("ftp://media.example.org/pic.jpg"), None);
    }

    #[test]
    fn test_media_filter_style_and_text_strategies() {
        let filter = MediaFilter::new(HOST);
        let style = "background-image: url('https://media.example.org/bg.jpg?w=10'); color: red";
        assert_eq!(filter.from_style(style), vec![url_root("bg.jpg")]);

        let text = r#"{"images":["https:\/\/media.example.org\/s\/one.jpg","https://other.net/x.jpg"]}"#;
        assert_eq!(
            filter.from_text(text),
            vec!["https://media.example.org/s/one.jpg".to_string()]
        );
    }

    fn url_root(name: &str) -> String {
        format!("https://{}/{}", HOST, name)
    }

    #[test]
    fn test_media_set_unions_strategies_and_dedupes() {
        let filter = MediaFilter::new(HOST);
        let media = RawMedia {
            attributes: vec![
                url("a.jpg"),
                format!("{}?v=2", url("a.jpg")),
                "https://elsewhere.com/b.jpg".to_string(),
                "data:image/gif;base64,R0lGOD".to_string(),
                url("logo.svg"),
            ],
            carousel: vec![url("b.jpg"), url("a.jpg")],
            styles: vec![format!("background-image:url(\"{}\")", url("c.jpg"))],
            scripts: vec![format!("window.__data = {{ src: '{}?x=1' }}", url("d.jpg"))],
            framework: vec![url("e.jpg"), url("b.jpg")],
        };

        let set = filter.collect(&media).into_vec();
        assert_eq!(
            set,
            vec![url("a.jpg"), url("b.jpg"), url("c.jpg"), url("d.jpg"), url("e.jpg")]
        );
    }

    #[test]
    fn test_supersede_requires_strict_improvement() {
        let statics = vec![url("1.jpg"), url("2.jpg")];
        let more = vec![url("1.jpg"), url("2.jpg"), url("3.jpg"), url("4.jpg")];
        assert_eq!(supersede(statics.clone(), more.clone()), more);
        assert_eq!(supersede(statics.clone(), vec![url("9.jpg")]), statics);
        assert_eq!(
            supersede(statics.clone(), vec![url("8.jpg"), url("9.jpg")]),
            statics
        );
    }

    #[tokio::test]
    async fn test_extract_resolves_fields_and_identity() {
        let session = MemorySession::new(vec![
            MemoryContainer::new(json!({
                "id": "post-1",
                "fields": {
                    "date": ["", "12/03/2024"],
                    "time": ["10:15"],
                    "event_type": ["", "", "Meal"],
                    "content": ["Lunch was pasta"]
                },
                "media": { "attributes": [url("lunch.jpg")] }
            })),
            MemoryContainer::new(json!({ "fields": {} })),
        ]);

        let extractor = SnapshotExtractor::new(&config());
        let records = extractor.extract(&session, "div.post").await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identity, "post-1");
        assert_eq!(records[0].date, "12/03/2024");
        assert_eq!(records[0].time, "10:15");
        assert_eq!(records[0].event_type, "Meal");
        assert_eq!(records[0].content, "Lunch was pasta");
        assert_eq!(records[0].media_urls, vec![url("lunch.jpg")]);

        assert_eq!(records[1].identity, "container_1");
        assert_eq!(records[1].date, "");
        assert!(records[1].media_urls.is_empty());
    }

    #[tokio::test]
    async fn test_extract_isolates_container_faults() {
        let session = MemorySession::new(vec![
            MemoryContainer::new(json!({ "id": "a" })),
            MemoryContainer::new(json!({ "error": "Cannot read properties of null" })),
            MemoryContainer::new(json!({ "id": "c", "indicators": "many" })),
            MemoryContainer::new(json!({ "id": "d" })),
        ]);

        let extractor = SnapshotExtractor::new(&config());
        let records = extractor.extract(&session, "div.post").await.unwrap();

        assert_eq!(records.len(), 4);
        assert!(!records[0].extraction_failed);
        assert!(records[1].extraction_failed);
        assert_eq!(records[1].ordinal, 1);
        assert_eq!(
            records[1].error.as_deref(),
            Some("Cannot read properties of null")
        );
        assert!(records[2].extraction_failed);
        assert!(records[2]
            .error
            .as_deref()
            .unwrap()
            .starts_with("malformed container payload"));
        assert_eq!(records[3].identity, "d");
    }

    #[tokio::test]
    async fn test_carousel_fallback_replaces_smaller_static_set() {
        let statics = vec![url("1.jpg"), url("2.jpg")];
        let session = MemorySession::new(vec![MemoryContainer::new(json!({
            "id": "gallery",
            "media": { "attributes": statics },
            "indicators": 5
        }))
        .with_slides(vec![
            vec![url("1.jpg")],
            vec![url("2.jpg")],
            vec![url("3.jpg")],
            vec![url("4.jpg")],
            vec![url("4.jpg")],
        ])]);

        let extractor = SnapshotExtractor::new(&config());
        let records = extractor.extract(&session, "div.post").await.unwrap();

        assert_eq!(records[0].carousel_expected, 5);
        assert_eq!(records[0].carousel_found, 2);
        assert_eq!(
            records[0].media_urls,
            vec![url("1.jpg"), url("2.jpg"), url("3.jpg"), url("4.jpg")]
        );
        assert_eq!(session.clicks(), 5);
    }

    #[tokio::test]
    async fn test_carousel_fallback_keeps_static_set_when_not_improved() {
        let session = MemorySession::new(vec![MemoryContainer::new(json!({
            "id": "gallery",
            "media": { "attributes": [url("1.jpg"), url("2.jpg")] },
            "indicators": 5
        }))
        .with_slides(vec![vec![url("7.jpg")]; 5])]);

        let extractor = SnapshotExtractor::new(&config());
        let records = extractor.extract(&session, "div.post").await.unwrap();

        assert_eq!(records[0].media_urls, vec![url("1.jpg"), url("2.jpg")]);
        assert_eq!(session.clicks(), 5);
    }

    #[tokio::test]
    async fn test_carousel_not_invoked_when_static_set_complete() {
        let session = MemorySession::new(vec![MemoryContainer::new(json!({
            "id": "single",
            "media": { "attributes": [url("1.jpg"), url("2.jpg")] },
            "indicators": 2
        }))
        .with_slides(vec![vec![url("1.jpg")], vec![url("2.jpg")]])]);

        let extractor = SnapshotExtractor::new(&config());
        let records = extractor.extract(&session, "div.post").await.unwrap();

        assert_eq!(records[0].media_urls.len(), 2);
        assert_eq!(session.clicks(), 0);
    }

    #[tokio::test]
    async fn test_extract_rejects_non_array_snapshot() {
        let session = MemorySession::new(Vec::new()).with_snapshot_override(json!("oops"));
        let extractor = SnapshotExtractor::new(&config());
        assert!(matches!(
            extractor.extract(&session, "div.post").await,
            Err(SessionError::Protocol(_))
        ));
    }
}
