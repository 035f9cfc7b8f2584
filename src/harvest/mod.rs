//! Harvest module - convergence-driven feed harvesting.
//!
//! This module provides the components the pipeline is assembled from:
//! - **Expansion**: [`PageExpander`] scrolls until the feed stops growing
//! - **Extraction**: [`SnapshotExtractor`] and [`CarouselResolver`]
//! - **Persistence**: [`Recorder`] over a [`RecordSink`]
//! - **Fetching**: [`AssetFetcher`] over an [`AssetSource`] and [`AssetStore`]
//! - **Pipeline**: run controller via [`pipeline::HarvestPipeline`]

pub mod carousel;
pub mod expand;
pub mod extract;
pub mod fetcher;
pub mod pipeline;
pub mod recorder;
pub mod scripts;
pub mod sessions;
pub mod traits;

// Re-export commonly used types
pub use traits::{
    AssetSource, AssetStore, FetchError, NoProgress, ProgressSink, ProgressUpdate, RecordSink,
    SinkError, TracingProgress, RECORD_COLUMNS,
};

pub use carousel::CarouselResolver;
pub use expand::{ExpansionReport, ExpansionState, PageExpander, StopReason};
pub use extract::{MediaFilter, SnapshotExtractor};
pub use fetcher::{AssetFetcher, BatchProgress, DirectoryStore, FetchSummary, HttpSource, MemoryStore};
pub use pipeline::{HarvestError, HarvestPipeline, HarvestSummary};
pub use recorder::{Acceptance, CsvSink, MemorySink, Recorder};
pub use sessions::{MemoryContainer, MemorySession, WebDriverSession};
