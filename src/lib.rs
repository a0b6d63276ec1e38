//! collate: fetch every item of a remote collection with a bounded worker pool, render each
//! one to a standalone artifact and bind the artifacts, in collection order, into HTML, EPUB
//! or Markdown deliverables.

pub mod cli;
pub mod config;
pub mod fetch;
pub mod locate;
pub mod merge;
pub mod model;
pub mod pool;
pub mod render;
pub mod sanitize;
pub mod session;
pub mod summary;

// Re-exports for the CLI and library consumers.
pub use fetch::{
    FailureClassifier, FetchError, FetchPolicy, ItemFetcher, KeywordClassifier, MarkerTable,
};
pub use locate::{ListingApiLocator, LocateError, ManifestLocator, SourceLocator};
pub use merge::{ArtifactMerger, MergeError, MergeOutcome, MergedItem, OutlineError, OutputFormat};
pub use model::{
    ArtifactHandle, Collection, ErrorKind, ItemDescriptor, ItemOutcome, ItemResult,
    MergedDeliverable, OutlineEntry, ProgressEvent, RawContent,
};
pub use pool::{
    ChannelProgressSink, ItemPipeline, NoopProgress, PoolError, PoolOutcome, ProgressSink,
    WorkerPool,
};
pub use render::{ArtifactRenderer, RenderError};
pub use sanitize::{CodeDetector, ContentSanitizer, SanitizeError, SanitizeRules, SanitizedDocument};
pub use session::{
    Credentials, HttpSession, HttpSessionFactory, Session, SessionError, SessionFactory,
};
pub use summary::RunSummary;
