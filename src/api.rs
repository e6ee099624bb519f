//! Remote API plumbing: the update wire format, the pluggable update source
//! seam, and the default HTTP long-poll client with its metrics.

pub mod client;
pub mod metrics;
pub mod options;
pub mod payload;

pub use client::{
    source_fn, FetchError, FetchOutcome, FetchRequest, HttpUpdateSource, SourceFn, UpdateSource,
    MAX_FETCH_LIMIT,
};
pub use metrics::SourceMetricsSnapshot;
pub use options::HttpSourceOptions;
pub use payload::Update;
