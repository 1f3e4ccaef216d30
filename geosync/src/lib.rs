//! GEOSYNC - live geographic feature sync
//!
//! Keeps an in-memory feature collection in step with a remote source:
//! fetch over HTTP (cached, retried, cancellable), poll on an interval or
//! listen on a WebSocket, and fold each batch in with a merge strategy.
//!
//! [`LiveSource`] wires those pieces together for one endpoint. The
//! component crates are re-exported for callers that want them directly.

pub mod live;
pub mod telemetry;

pub use geosync_cache as cache;
pub use geosync_fetch as fetch;
pub use geosync_merge as merge;
pub use geosync_retry as retry;
pub use geosync_stream as stream;

pub use geosync_cache::{CacheEntry, CacheStats, ConditionalHeaders, ResponseCache};
pub use geosync_core::{
    CacheConfig, ConfigError, ConnectionError, Feature, FeatureCollection, FetchConfig,
    FetchError, GeosyncError, GeosyncResult, MergeError, PollerError, RetryConfig, StreamConfig,
    StreamSettings, SyncConfig, ValidationError,
};
pub use geosync_fetch::{FetchListener, FetchOptions, FetchResult, Fetcher, Poller, PollerState};
pub use geosync_merge::{merge, merge_at, MergeOptions, MergeResult, MergeStrategy};
pub use geosync_retry::{Retrier, RetryError, RetryObserver};
pub use geosync_stream::{
    ConnectionState, StreamConnection, StreamEvent, StreamEventKind, StreamMessage,
};
pub use live::{LiveSource, MergeStats, RefreshPolicy};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};
