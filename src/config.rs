//! Harvest configuration.
//!
//! Every selector and threshold the pipeline uses is carried here and handed
//! to the components at construction, so tests can shrink timings freely.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::RunMode;

/// Default user agent for asset downloads
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub strategies: StrategyConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub carousel: CarouselConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HarvestConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: HarvestConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all fields, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.feed.container_selector.trim().is_empty() {
            errors.push("feed.container_selector must not be empty".to_string());
        }
        if self.feed.allowed_host.trim().is_empty() {
            errors.push("feed.allowed_host must not be empty".to_string());
        }
        if let Some(url) = &self.feed.url {
            if url::Url::parse(url).is_err() {
                errors.push(format!("feed.url '{}' is not a valid URL", url));
            }
        }

        for (name, chain) in [
            ("date", &self.strategies.date),
            ("time", &self.strategies.time),
            ("event_type", &self.strategies.event_type),
            ("content", &self.strategies.content),
        ] {
            if chain.is_empty() {
                errors.push(format!("strategies.{} needs at least one selector", name));
            }
        }

        if self.expansion.stall_threshold == 0 {
            errors.push("expansion.stall_threshold must be positive".to_string());
        }
        if self.expansion.max_iterations == 0 {
            errors.push("expansion.max_iterations must be positive".to_string());
        }
        if self.expansion.poll_interval_ms == 0 {
            errors.push("expansion.poll_interval_ms must be positive".to_string());
        }
        if self.recorder.batch_size == 0 {
            errors.push("recorder.batch_size must be positive".to_string());
        }
        if self.fetch.batch_size == 0 {
            errors.push("fetch.batch_size must be positive".to_string());
        }
        if self.fetch.workers == 0 {
            errors.push("fetch.workers must be positive".to_string());
        }
        if self.fetch.timeout_secs == 0 {
            errors.push("fetch.timeout_secs must be positive".to_string());
        }
        if self.run.test_record_limit == 0 {
            errors.push("run.test_record_limit must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// CSV file for a run in `mode`.
    pub fn records_path(&self, mode: RunMode) -> PathBuf {
        self.run.output_dir.join(format!("feed_records_{}.csv", mode))
    }

    /// Asset directory for a run in `mode`.
    pub fn assets_dir(&self, mode: RunMode) -> PathBuf {
        self.run.output_dir.join(format!("feed_assets_{}", mode))
    }
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Page to open before harvesting; `None` harvests the page as-is
    pub url: Option<String>,
    /// Selector matching one element per feed record
    pub container_selector: String,
    /// Only media served from this host is kept
    pub allowed_host: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            container_selector: "div[data-id*='newsfeed-event-wrapper']".to_string(),
            allowed_host: "storage101.lon3.clouddrive.com".to_string(),
        }
    }
}

// ============================================================================
// Extraction strategies
// ============================================================================

/// One selector lookup in a field chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStrategy {
    pub selector: String,
    /// Join the text of every match instead of taking the first match
    #[serde(default)]
    pub join: bool,
}

impl FieldStrategy {
    pub fn first(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            join: false,
        }
    }

    pub fn joined(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            join: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub identity_attributes: Vec<String>,
    pub date: Vec<FieldStrategy>,
    pub time: Vec<FieldStrategy>,
    pub event_type: Vec<FieldStrategy>,
    pub content: Vec<FieldStrategy>,
    /// Attributes read from media elements, `src` first
    pub media_attributes: Vec<String>,
    /// Elements searched by the direct-attribute strategy
    pub media_elements: String,
    /// Elements whose class or id hints at a carousel
    pub carousel_scope: String,
    pub indicator_selector: String,
    /// Read client-framework state attached to containers
    pub framework_state: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        let first = |sels: &[&str]| -> Vec<FieldStrategy> {
            sels.iter().map(|s| FieldStrategy::first(s)).collect()
        };
        Self {
            identity_attributes: vec!["data-id".to_string()],
            date: first(&[
                "div[data-id=\"newsfeed-event-date\"]",
                "[data-reactid*=\"date\"]",
                ".date",
                "[class*=\"date\"]",
                "time",
                ".timestamp",
            ]),
            time: first(&[
                "span[data-id=\"newsfeed-event-time-mobile-only\"]",
                "[data-reactid*=\"time\"]",
                ".time",
                "[class*=\"time\"]",
                ".timestamp time",
            ]),
            event_type: first(&[
                "span[data-id=\"newsfeed-event-type\"]",
                "[data-reactid*=\"event\"]",
                ".event-type",
                "[class*=\"event\"]",
                "h1",
                "h2",
                "h3",
                ".title",
                "[class*=\"title\"]",
            ]),
            content: [
                "span[data-id=\"newsfeed-event-title\"]",
                "p",
                ".content",
                "[class*=\"content\"]",
                ".description",
                "[class*=\"description\"]",
                ".text",
                "[class*=\"text\"]",
            ]
            .iter()
            .map(|s| FieldStrategy::joined(s))
            .collect(),
            media_attributes: vec![
                "src".to_string(),
                "data-src".to_string(),
                "data-lazy-src".to_string(),
                "data-original".to_string(),
                "srcset".to_string(),
            ],
            media_elements: "img, source".to_string(),
            carousel_scope: "[class*='carousel'], [class*='slide'], [class*='gallery'], \
                             [id*='carousel'], [id*='slide'], [id*='gallery'], \
                             div[class*='photo'], div[class*='image-area']"
                .to_string(),
            indicator_selector: "[class*='circle']".to_string(),
            framework_state: true,
        }
    }
}

// ============================================================================
// Expansion
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    /// Consecutive iterations without growth before convergence
    pub stall_threshold: u32,
    /// Hard ceiling on expansion iterations
    pub max_iterations: u32,
    /// How long to wait for the container count to grow after a trigger
    pub growth_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Pause after the growth wait before re-measuring (lazy loading)
    pub settle_ms: u64,
    pub scroll_steps: u32,
    pub scroll_delta: i64,
    pub page_down_presses: u32,
    pub arrow_down_presses: u32,
    /// Pause between individual scroll steps and key presses
    pub step_pause_ms: u64,
    pub wheel_events: u32,
    pub wheel_delta: i64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            stall_threshold: 3,
            max_iterations: 80,
            growth_timeout_ms: 10_000,
            poll_interval_ms: 250,
            settle_ms: 5_000,
            scroll_steps: 20,
            scroll_delta: 700,
            page_down_presses: 8,
            arrow_down_presses: 20,
            step_pause_ms: 100,
            wheel_events: 10,
            wheel_delta: 200,
        }
    }
}

impl ExpansionConfig {
    pub fn growth_timeout(&self) -> Duration {
        Duration::from_millis(self.growth_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CarouselConfig {
    /// Wait after activating an indicator before re-reading media
    pub settle_ms: u64,
}

impl Default for CarouselConfig {
    fn default() -> Self {
        Self { settle_ms: 800 }
    }
}

impl CarouselConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

// ============================================================================
// Recorder / Fetch / Run
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub batch_size: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { batch_size: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            workers: 5,
            timeout_secs: 15,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Records processed in test mode
    pub test_record_limit: usize,
    /// Time allowed for the page to report ready at start
    pub ready_timeout_secs: u64,
    pub output_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            test_record_limit: 50,
            ready_timeout_secs: 30,
            output_dir: PathBuf::from("."),
        }
    }
}

impl RunConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: LogLevel::Info,
        }
    }
}
