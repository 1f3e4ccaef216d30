//! GEOSYNC Core - shared types
//!
//! Feature collections, the error taxonomy, configuration, and the small
//! primitives (clock, listener registry) every other crate builds on.
//! No I/O lives here.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod feature;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    CacheConfig, FetchConfig, RetryConfig, StreamConfig, StreamSettings, SyncConfig,
};
pub use error::{
    ConfigError, ConnectionError, FetchError, GeosyncError, GeosyncResult, MergeError,
    PollerError, ValidationError,
};
pub use events::{EventBus, ListenerId};
pub use feature::{Feature, FeatureCollection, Properties};

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;
