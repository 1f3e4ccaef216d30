//! Feature-collection fetcher.
//!
//! One logical `fetch` is: cache lookup, then up to `max_retries + 1` HTTP
//! attempts, each bounded by `timeout_ms` and by the abort token, then payload
//! validation and cache population. Callers see either a result or exactly
//! one terminal [`FetchError`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use geosync_cache::{CacheEntry, CacheStats, ResponseCache};
use geosync_core::{
    system_clock, FeatureCollection, FetchConfig, FetchError, SharedClock, SyncConfig,
};
use geosync_retry::{Retrier, RetryError, RetryObserver};
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{HttpResponse, HttpTransport, ReqwestTransport};

/// `Accept` header sent with every request.
pub const ACCEPT_GEOJSON: &str = "application/geo+json,application/json";

/// Lifecycle hooks for a single fetch. Every method defaults to a no-op.
pub trait FetchListener: Send + Sync {
    fn on_start(&self, _url: &str) {}

    /// A failed attempt is about to be retried after `delay`.
    fn on_retry(&self, _attempt: u32, _error: &FetchError, _delay: Duration) {}

    fn on_complete(&self, _data: &FeatureCollection, _from_cache: bool) {}

    /// The fetch failed terminally.
    fn on_error(&self, _error: &FetchError) {}
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Extra request headers; they override configured defaults.
    pub headers: Vec<(String, String)>,
    /// Go to the network even if a fresh entry is cached.
    pub skip_cache: bool,
    /// Go to the network with the cached entry's validators attached.
    pub revalidate: bool,
    pub listener: Option<Arc<dyn FetchListener>>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn revalidate(mut self) -> Self {
        self.revalidate = true;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn FetchListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("headers", &self.headers)
            .field("skip_cache", &self.skip_cache)
            .field("revalidate", &self.revalidate)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Outcome of one `fetch` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<T = FeatureCollection> {
    pub data: T,
    /// True when no body was downloaded: a fresh cache hit or a 304.
    pub from_cache: bool,
    pub feature_count: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
}

impl Validators {
    fn from_response(response: &HttpResponse) -> Self {
        Self {
            etag: response.header("etag").map(str::to_string),
            last_modified: response.header("last-modified").map(str::to_string),
        }
    }
}

enum Attempt {
    Fresh(FeatureCollection, Validators),
    NotModified(Validators),
}

/// Bridges retrier callbacks to logging and the caller's listener.
struct AttemptObserver<'a> {
    url: &'a str,
    listener: Option<&'a dyn FetchListener>,
}

impl RetryObserver<FetchError> for AttemptObserver<'_> {
    fn is_retryable(&self, error: &FetchError) -> bool {
        error.is_retryable()
    }

    fn on_retry(&self, attempt: u32, error: &FetchError, delay: Duration) {
        warn!(
            url = %self.url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Fetch attempt failed, retrying"
        );
        if let Some(listener) = self.listener {
            listener.on_retry(attempt, error, delay);
        }
    }
}

/// HTTP fetcher for feature collections.
///
/// Safe to share across tasks behind an `Arc`. Concurrent fetches of the
/// same URL are not deduplicated; the last one to finish wins the cache slot.
pub struct Fetcher<H: HttpTransport = ReqwestTransport> {
    transport: Arc<H>,
    cache: Option<Mutex<ResponseCache<FeatureCollection>>>,
    retrier: Option<Retrier>,
    config: FetchConfig,
    abort: Mutex<CancellationToken>,
}

impl Fetcher<ReqwestTransport> {
    /// Fetcher over a default `reqwest` client.
    pub fn from_config(config: &SyncConfig) -> Result<Self, FetchError> {
        Ok(Self::new(Arc::new(ReqwestTransport::new()?), config))
    }
}

impl<H: HttpTransport> Fetcher<H> {
    pub fn new(transport: Arc<H>, config: &SyncConfig) -> Self {
        Self::with_clock(transport, config, system_clock())
    }

    /// Like [`new`](Self::new), with cache ages measured by `clock`.
    pub fn with_clock(transport: Arc<H>, config: &SyncConfig, clock: SharedClock) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Mutex::new(ResponseCache::new(config.cache.clone(), clock)));
        let retrier = config
            .retry
            .enabled
            .then(|| Retrier::new(config.retry.clone()));

        Self {
            transport,
            cache,
            retrier,
            config: config.fetch.clone(),
            abort: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn transport(&self) -> &Arc<H> {
        &self.transport
    }

    /// Retrieve `url`, serving a fresh cached copy when allowed.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, FetchError> {
        self.fetch_with_ttl(url, options, None).await
    }

    /// Fetch `url` into the cache without returning it. `ttl_ms` overrides
    /// the cache default for this entry.
    pub async fn prefetch(&self, url: &str, ttl_ms: Option<u64>) -> Result<(), FetchError> {
        let options = FetchOptions::new().skip_cache();
        let result = self.fetch_with_ttl(url, &options, ttl_ms).await?;
        debug!(url = %url, features = result.feature_count, "Prefetched");
        Ok(())
    }

    /// Drop the cached entry for `url`.
    pub fn invalidate(&self, url: &str) -> bool {
        self.cache
            .as_ref()
            .map(|cache| cache.lock().delete(url))
            .unwrap_or(false)
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }

    /// Cache counters; all zero when caching is disabled.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .as_ref()
            .map(|cache| cache.lock().stats())
            .unwrap_or_default()
    }

    /// Cancel every in-flight attempt and pending retry delay. Fetches
    /// started afterwards are unaffected.
    pub fn abort_all(&self) {
        let mut token = self.abort.lock();
        token.cancel();
        *token = CancellationToken::new();
        info!("Aborted all in-flight fetches");
    }

    async fn fetch_with_ttl(
        &self,
        url: &str,
        options: &FetchOptions,
        ttl_ms: Option<u64>,
    ) -> Result<FetchResult, FetchError> {
        let started = Instant::now();
        let listener = options.listener.as_deref();
        if let Some(listener) = listener {
            listener.on_start(url);
        }

        if !options.skip_cache && !options.revalidate {
            if let Some(data) = self.cached(url) {
                debug!(url = %url, "Cache hit");
                return Ok(self.complete(data, true, started, listener));
            }
        }

        match self.retrieve(url, options, ttl_ms).await {
            Ok((data, from_cache)) => Ok(self.complete(data, from_cache, started, listener)),
            Err(err) => {
                warn!(url = %url, error = %err, "Fetch failed");
                if let Some(listener) = listener {
                    listener.on_error(&err);
                }
                Err(err)
            }
        }
    }

    async fn retrieve(
        &self,
        url: &str,
        options: &FetchOptions,
        ttl_ms: Option<u64>,
    ) -> Result<(FeatureCollection, bool), FetchError> {
        let conditional = if options.revalidate {
            self.conditional_headers(url)
        } else {
            Vec::new()
        };
        let headers = self.request_headers(&options.headers, conditional)?;
        let token = self.abort.lock().clone();

        let outcome = match &self.retrier {
            Some(retrier) => {
                let observer = AttemptObserver {
                    url,
                    listener: options.listener.as_deref(),
                };
                let (headers, token) = (&headers, &token);
                retrier
                    .execute_cancellable(move |_| self.attempt(url, headers, token), &observer, token)
                    .await
                    .map_err(|err| match err {
                        RetryError::Exhausted { attempts, last } => FetchError::MaxRetriesExceeded {
                            attempts,
                            last: Box::new(last),
                        },
                        RetryError::Rejected(err) => err,
                        RetryError::Cancelled => FetchError::Aborted,
                    })?
            }
            None => self.attempt(url, &headers, &token).await?,
        };

        match outcome {
            Attempt::Fresh(data, validators) => {
                self.store(url, &data, validators, ttl_ms);
                Ok((data, false))
            }
            Attempt::NotModified(validators) => {
                let data = self.refresh_entry(url, validators).ok_or_else(|| {
                    FetchError::http(304, "Not Modified without a cached response")
                })?;
                debug!(url = %url, "Not modified, serving cached body");
                Ok((data, true))
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        headers: &[(String, String)],
        token: &CancellationToken,
    ) -> Result<Attempt, FetchError> {
        let request = tokio::time::timeout(self.config.timeout(), self.transport.get(url, headers));
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Aborted),
            result = request => match result {
                Ok(response) => response?,
                Err(_) => {
                    return Err(FetchError::Timeout {
                        timeout_ms: self.config.timeout_ms,
                    })
                }
            },
        };

        if response.is_not_modified() {
            return Ok(Attempt::NotModified(Validators::from_response(&response)));
        }
        if !response.is_success() {
            return Err(FetchError::http(response.status, response.status_text));
        }

        let data = FeatureCollection::from_slice(&response.body)?;
        Ok(Attempt::Fresh(data, Validators::from_response(&response)))
    }

    fn cached(&self, url: &str) -> Option<FeatureCollection> {
        let mut cache = self.cache.as_ref()?.lock();
        cache.get(url).map(|entry| entry.data.clone())
    }

    fn conditional_headers(&self, url: &str) -> Vec<(String, String)> {
        let Some(cache) = &self.cache else {
            return Vec::new();
        };
        cache
            .lock()
            .conditional_headers(url)
            .to_pairs()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    /// Layer configured, caller and conditional headers over `Accept`. A name
    /// or value that cannot go on the wire fails the fetch up front.
    fn request_headers(
        &self,
        extra: &[(String, String)],
        conditional: Vec<(String, String)>,
    ) -> Result<Vec<(String, String)>, FetchError> {
        let mut headers = vec![("Accept".to_string(), ACCEPT_GEOJSON.to_string())];
        let layers = self
            .config
            .headers
            .iter()
            .chain(extra.iter().map(|(name, value)| (name, value)))
            .map(|(name, value)| (name.clone(), value.clone()))
            .chain(conditional);
        for (name, value) in layers {
            check_header(&name, &value)?;
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
            headers.push((name, value));
        }
        Ok(headers)
    }

    fn store(&self, url: &str, data: &FeatureCollection, validators: Validators, ttl_ms: Option<u64>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut cache = cache.lock();
        let entry = CacheEntry {
            data: data.clone(),
            timestamp: cache.now_ms(),
            ttl: ttl_ms,
            etag: validators.etag,
            last_modified: validators.last_modified,
        };
        cache.set(url, entry);
    }

    /// Re-stamp the cached entry after a 304, keeping old validators the
    /// response did not replace.
    fn refresh_entry(&self, url: &str, validators: Validators) -> Option<FeatureCollection> {
        let mut cache = self.cache.as_ref()?.lock();
        let previous = cache.peek(url)?.clone();
        let entry = CacheEntry {
            data: previous.data.clone(),
            timestamp: cache.now_ms(),
            ttl: previous.ttl,
            etag: validators.etag.or(previous.etag),
            last_modified: validators.last_modified.or(previous.last_modified),
        };
        cache.set(url, entry);
        Some(previous.data)
    }

    fn complete(
        &self,
        data: FeatureCollection,
        from_cache: bool,
        started: Instant,
        listener: Option<&dyn FetchListener>,
    ) -> FetchResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        let feature_count = data.len();
        debug!(feature_count, from_cache, duration_ms, "Fetch complete");
        if let Some(listener) = listener {
            listener.on_complete(&data, from_cache);
        }
        FetchResult {
            data,
            from_cache,
            feature_count,
            duration_ms,
        }
    }
}

fn check_header(name: &str, value: &str) -> Result<(), FetchError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| FetchError::InvalidRequest {
        reason: format!("header name {name:?}: {e}"),
    })?;
    HeaderValue::from_str(value).map_err(|e| FetchError::InvalidRequest {
        reason: format!("header {name} value: {e}"),
    })?;
    Ok(())
}

impl<H: HttpTransport> fmt::Debug for Fetcher<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("cache", &self.cache.is_some())
            .field("retry", &self.retrier.as_ref().map(Retrier::config))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
