use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Longest error message carried on a failed record.
pub const MAX_ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub identity: String,
    pub ordinal: usize,
    pub date: String,
    pub time: String,
    pub event_type: String,
    pub content: String,
    pub media_urls: Vec<String>,
    pub carousel_expected: usize,
    pub carousel_found: usize,
    pub extraction_failed: bool,
    pub error: Option<String>,
}

impl FeedRecord {
    /// Record standing in for a container whose extraction raised a fault.
    pub fn failed(ordinal: usize, message: &str) -> Self {
        Self {
            identity: format!("error_container_{}", ordinal),
            ordinal,
            date: String::new(),
            time: String::new(),
            event_type: String::new(),
            content: String::new(),
            media_urls: Vec::new(),
            carousel_expected: 0,
            carousel_found: 0,
            extraction_failed: true,
            error: Some(truncate_chars(message, MAX_ERROR_CHARS)),
        }
    }

    /// Synthetic identity used when the container carries none.
    pub fn positional_identity(ordinal: usize) -> String {
        format!("container_{}", ordinal)
    }

    pub fn image_count(&self) -> usize {
        self.media_urls.len()
    }
}

/// Insertion-ordered set of media URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl MediaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the URL was not already present.
    pub fn insert(&mut self, url: String) -> bool {
        if self.seen.contains(&url) {
            return false;
        }
        self.seen.insert(url.clone());
        self.order.push(url);
        true
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, urls: I) {
        for url in urls {
            self.insert(url);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.order
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetTask {
    pub url: String,
    pub destination: String,
}

impl AssetTask {
    /// Builds one task per media URL of `record`, named after the record's
    /// position among accepted records so re-runs land on the same files.
    pub fn for_record(record: &FeedRecord, record_ordinal: usize) -> Vec<AssetTask> {
        record
            .media_urls
            .iter()
            .enumerate()
            .map(|(media_ordinal, url)| AssetTask {
                url: url.clone(),
                destination: destination_name(
                    &record.date,
                    &record.event_type,
                    record_ordinal,
                    media_ordinal,
                    url,
                ),
            })
            .collect()
    }
}

/// `<date>_<event type>_<record>_<media>_<filename>`
pub fn destination_name(
    date: &str,
    event_type: &str,
    record_ordinal: usize,
    media_ordinal: usize,
    url: &str,
) -> String {
    let date_part = if date.trim().is_empty() {
        format!("post_{}", record_ordinal)
    } else {
        truncate_chars(&date.trim().replace(['/', ':'], "-"), 20)
    };

    let type_part = if event_type.trim().is_empty() {
        "unknown".to_string()
    } else {
        event_type.trim().replace(['/', '\\', ':'], "-")
    };

    let file_part = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty() && name.contains('.'))
        .map(str::to_string)
        .unwrap_or_else(|| format!("image_{}.jpg", media_ordinal));

    format!(
        "{}_{}_{}_{}_{}",
        date_part, type_part, record_ordinal, media_ordinal, file_part
    )
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Current render only, capped record count, assets fetched per record.
    Test,
    /// Expand to convergence, one pass, assets fetched at the end.
    Full,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "test" => Ok(Self::Test),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown run mode '{}', expected 'test' or 'full'", other)),
        }
    }
}

/// Shared stop flag, observed at loop and batch boundaries only.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(date: &str, event_type: &str, urls: &[&str]) -> FeedRecord {
        FeedRecord {
            identity: "id".to_string(),
            ordinal: 0,
            date: date.to_string(),
            time: String::new(),
            event_type: event_type.to_string(),
            content: String::new(),
            media_urls: urls.iter().map(|u| u.to_string()).collect(),
            carousel_expected: 0,
            carousel_found: urls.len(),
            extraction_failed: false,
            error: None,
        }
    }

    #[test]
    fn test_destination_name_uses_original_filename() {
        let name = destination_name(
            "12/03/2024 10:15",
            "Photo",
            7,
            2,
            "https://cdn.example/a/b/pic.JPG?sig=1",
        );
        assert_eq!(name, "12-03-2024 10-15_Photo_7_2_pic.JPG");
    }

    #[test]
    fn test_destination_name_fallbacks() {
        let name = destination_name("", "", 3, 1, "https://cdn.example/a/blob");
        assert_eq!(name, "post_3_unknown_3_1_image_1.jpg");
    }

    #[test]
    fn test_destination_name_truncates_long_dates() {
        let name = destination_name(
            "Wednesday 12 March 2024 at noon",
            "Meal",
            0,
            0,
            "https://cdn.example/x.png",
        );
        assert!(name.starts_with("Wednesday 12 March 2_Meal_0_0_"));
    }

    #[test]
    fn test_asset_tasks_are_stable_across_runs() {
        let rec = record("01/02/2024", "Activity", &["https://h/x.jpg", "https://h/y"]);
        let first = AssetTask::for_record(&rec, 4);
        let second = AssetTask::for_record(&rec, 4);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].destination, "01-02-2024_Activity_4_1_image_1.jpg");
    }

    #[test]
    fn test_failed_record_truncates_message() {
        let long = "x".repeat(500);
        let rec = FeedRecord::failed(9, &long);
        assert!(rec.extraction_failed);
        assert_eq!(rec.identity, "error_container_9");
        assert_eq!(rec.error.unwrap().len(), MAX_ERROR_CHARS);
    }

    #[test]
    fn test_media_set_keeps_discovery_order() {
        let mut set = MediaSet::new();
        assert!(set.insert("b".to_string()));
        assert!(set.insert("a".to_string()));
        assert!(!set.insert("b".to_string()));
        assert_eq!(set.into_vec(), vec!["b", "a"]);
    }

    #[test]
    fn test_run_mode_parsing() {
        assert_eq!("FULL".parse::<RunMode>().unwrap(), RunMode::Full);
        assert_eq!("test".parse::<RunMode>().unwrap(), RunMode::Test);
        assert!("fast".parse::<RunMode>().is_err());
    }
}
