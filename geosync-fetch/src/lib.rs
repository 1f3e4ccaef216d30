//! GEOSYNC Fetch - network retrieval of feature collections
//!
//! - [`Fetcher`]: HTTP GET with response caching, conditional revalidation,
//!   bounded retry, per-attempt timeout and abort.
//! - [`Poller`]: fixed-interval scheduling of any fetch operation.
//! - [`HttpTransport`]: the seam between the fetcher and the HTTP client.

pub mod fetcher;
pub mod poller;
pub mod transport;

pub use fetcher::{FetchListener, FetchOptions, FetchResult, Fetcher, ACCEPT_GEOJSON};
pub use poller::{PollErrorHandler, Poller, PollerState};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};
