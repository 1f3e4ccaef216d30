//! One live data source: an endpoint, a refresh policy and a merge policy.
//!
//! Every batch that arrives, whether from a manual refresh, a poll cycle or
//! a stream message, is merged into the current dataset and published on a
//! `watch` channel. Merges are serialized, so each batch sees the result of
//! the previous one.

use std::sync::Arc;

use geosync_core::{
    FeatureCollection, GeosyncResult, MergeError, StreamConfig, StreamSettings,
};
use geosync_fetch::{FetchOptions, Fetcher, HttpTransport, Poller, PollerState, ReqwestTransport};
use geosync_merge::{merge, MergeOptions, MergeResult};
use geosync_stream::{ConnectionState, StreamConnection, StreamEvent, StreamEventKind, StreamMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How new data reaches the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Only [`LiveSource::refresh`] and [`LiveSource::apply`].
    Manual,
    Poll { interval_ms: u64 },
    /// Each JSON message on the stream that is a feature collection.
    Stream,
}

/// Counters from the most recent merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub total: usize,
}

impl From<&MergeResult> for MergeStats {
    fn from(result: &MergeResult) -> Self {
        Self {
            added: result.added,
            updated: result.updated,
            removed: result.removed,
            total: result.total,
        }
    }
}

struct Dataset {
    options: MergeOptions,
    current: watch::Sender<FeatureCollection>,
    last_merge: Mutex<Option<MergeStats>>,
}

impl Dataset {
    fn apply(&self, incoming: &FeatureCollection) -> Result<MergeResult, MergeError> {
        // Held across read-merge-publish so concurrent batches do not interleave.
        let mut last = self.last_merge.lock();
        let existing = self.current.borrow().clone();
        let result = merge(&existing, incoming, &self.options)?;
        *last = Some(MergeStats::from(&result));
        self.current.send_replace(result.data.clone());
        debug!(
            strategy = %self.options.strategy,
            added = result.added,
            updated = result.updated,
            removed = result.removed,
            total = result.total,
            "Merged batch"
        );
        Ok(result)
    }
}

pub struct LiveSource<H: HttpTransport + 'static = ReqwestTransport> {
    endpoint: String,
    policy: RefreshPolicy,
    fetcher: Arc<Fetcher<H>>,
    dataset: Arc<Dataset>,
    poller: Poller,
    stream_settings: StreamSettings,
    stream: Option<StreamConnection>,
}

impl<H: HttpTransport + 'static> LiveSource<H> {
    /// Fails if `merge_options` cannot be used, before anything is fetched.
    pub fn new(
        endpoint: impl Into<String>,
        policy: RefreshPolicy,
        merge_options: MergeOptions,
        fetcher: Arc<Fetcher<H>>,
    ) -> Result<Self, MergeError> {
        merge_options.validate()?;
        let endpoint = endpoint.into();
        let (current, _) = watch::channel(FeatureCollection::empty());
        let dataset = Arc::new(Dataset {
            options: merge_options,
            current,
            last_merge: Mutex::new(None),
        });

        let poller = {
            let endpoint = endpoint.clone();
            Poller::new().on_error(move |err| {
                warn!(endpoint = %endpoint, error = %err, "Poll cycle failed");
            })
        };

        Ok(Self {
            endpoint,
            policy,
            fetcher,
            dataset,
            poller,
            stream_settings: StreamSettings::default(),
            stream: None,
        })
    }

    /// Start from `dataset` instead of an empty collection.
    pub fn with_dataset(self, dataset: FeatureCollection) -> Self {
        self.dataset.current.send_replace(dataset);
        self
    }

    pub fn with_stream_settings(mut self, settings: StreamSettings) -> Self {
        self.stream_settings = settings;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Begin receiving updates according to the refresh policy. A stream
    /// source resolves once the connection is open.
    pub async fn start(&mut self) -> GeosyncResult<()> {
        match self.policy.clone() {
            RefreshPolicy::Manual => {
                debug!(endpoint = %self.endpoint, "Manual source, nothing to start");
            }
            RefreshPolicy::Poll { interval_ms } => {
                let fetcher = Arc::clone(&self.fetcher);
                let dataset = Arc::clone(&self.dataset);
                let endpoint = self.endpoint.clone();
                self.poller.start(
                    move || {
                        let fetcher = Arc::clone(&fetcher);
                        let dataset = Arc::clone(&dataset);
                        let endpoint = endpoint.clone();
                        async move {
                            let options = FetchOptions::new().skip_cache();
                            let fetched = fetcher.fetch(&endpoint, &options).await?;
                            if let Err(err) = dataset.apply(&fetched.data) {
                                warn!(endpoint = %endpoint, error = %err, "Dropping polled batch");
                            }
                            Ok(())
                        }
                    },
                    interval_ms,
                )?;
                info!(endpoint = %self.endpoint, interval_ms, "Polling source started");
            }
            RefreshPolicy::Stream => {
                // A connection that dropped and settled is reopened in place,
                // keeping its listener. A live one rejects with AlreadyExists.
                if let Some(connection) = &self.stream {
                    connection.connect().await?;
                    info!(endpoint = %self.endpoint, "Streaming source reopened");
                    return Ok(());
                }
                let config = StreamConfig::from_settings(&self.endpoint, &self.stream_settings);
                let connection = StreamConnection::new(config);
                let dataset = Arc::clone(&self.dataset);
                connection.on(StreamEventKind::Message, move |event| {
                    if let StreamEvent::Message(message) = event {
                        apply_stream_message(&dataset, message);
                    }
                });
                connection.connect().await?;
                self.stream = Some(connection);
                info!(endpoint = %self.endpoint, "Streaming source started");
            }
        }
        Ok(())
    }

    /// Stop polling and close the stream. The dataset is kept.
    pub fn stop(&mut self) {
        self.poller.stop();
        if let Some(connection) = self.stream.take() {
            connection.disconnect();
        }
    }

    /// Fetch once (cache permitting) and merge the result.
    pub async fn refresh(&self) -> GeosyncResult<MergeResult> {
        let fetched = self.fetcher.fetch(&self.endpoint, &FetchOptions::new()).await?;
        Ok(self.dataset.apply(&fetched.data)?)
    }

    /// Merge a batch obtained elsewhere.
    pub fn apply(&self, incoming: &FeatureCollection) -> Result<MergeResult, MergeError> {
        self.dataset.apply(incoming)
    }

    /// Current merged dataset.
    pub fn dataset(&self) -> FeatureCollection {
        self.dataset.current.borrow().clone()
    }

    /// Receiver that observes every published dataset.
    pub fn subscribe(&self) -> watch::Receiver<FeatureCollection> {
        self.dataset.current.subscribe()
    }

    pub fn last_merge(&self) -> Option<MergeStats> {
        *self.dataset.last_merge.lock()
    }

    pub fn poller_state(&self) -> PollerState {
        self.poller.state()
    }

    pub fn stream_state(&self) -> Option<ConnectionState> {
        self.stream.as_ref().map(StreamConnection::state)
    }
}

fn apply_stream_message(dataset: &Dataset, message: &StreamMessage) {
    let Some(value) = message.as_json() else {
        debug!("Ignoring non-JSON stream message");
        return;
    };
    match FeatureCollection::from_value(value.clone()) {
        Ok(batch) => {
            if let Err(err) = dataset.apply(&batch) {
                warn!(error = %err, "Dropping streamed batch");
            }
        }
        Err(err) => warn!(error = %err, "Ignoring stream message that is not a feature collection"),
    }
}

impl<H: HttpTransport + 'static> Drop for LiveSource<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use geosync_core::{FetchError, SyncConfig};
    use geosync_fetch::HttpResponse;
    use geosync_test_utils::assertions::names;
    use geosync_test_utils::fixtures::{collection, keyed, named, vehicles, vehicles_json};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Serves the same body on every request.
    struct StaticTransport {
        body: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HttpTransport for StaticTransport {
        async fn get(&self, _url: &str, _headers: &[(String, String)]) -> Result<HttpResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(200).with_body(self.body.clone()))
        }
    }

    fn source(policy: RefreshPolicy, options: MergeOptions) -> (LiveSource<StaticTransport>, Arc<StaticTransport>) {
        let transport = Arc::new(StaticTransport {
            body: vehicles_json(),
            calls: AtomicU32::new(0),
        });
        let fetcher = Arc::new(Fetcher::new(Arc::clone(&transport), &SyncConfig::default()));
        let source = LiveSource::new("https://feeds.example.test/vehicles", policy, options, fetcher).unwrap();
        (source, transport)
    }

    #[test]
    fn test_invalid_merge_options_rejected_up_front() {
        let transport = Arc::new(StaticTransport {
            body: String::new(),
            calls: AtomicU32::new(0),
        });
        let fetcher = Arc::new(Fetcher::new(transport, &SyncConfig::default()));
        let options = MergeOptions {
            update_key: None,
            ..MergeOptions::merge("vehicle_id")
        };
        let err = LiveSource::new("https://x.test", RefreshPolicy::Manual, options, fetcher).err();
        assert_eq!(err, Some(MergeError::MissingUpdateKey));
    }

    #[test]
    fn test_refresh_policy_deserializes() {
        let poll: RefreshPolicy =
            serde_json::from_value(serde_json::json!({"mode": "poll", "interval_ms": 5000})).unwrap();
        assert_eq!(poll, RefreshPolicy::Poll { interval_ms: 5_000 });
        let stream: RefreshPolicy = serde_json::from_value(serde_json::json!({"mode": "stream"})).unwrap();
        assert_eq!(stream, RefreshPolicy::Stream);
    }

    #[tokio::test]
    async fn test_apply_publishes_merged_dataset() {
        let (source, _) = source(RefreshPolicy::Manual, MergeOptions::merge("k"));
        let source = source.with_dataset(collection(vec![keyed("k", 1, "a"), keyed("k", 2, "b")]));
        let mut rx = source.subscribe();

        let result = source
            .apply(&collection(vec![keyed("k", 2, "B"), keyed("k", 3, "c")]))
            .unwrap();
        assert_eq!((result.added, result.updated, result.total), (1, 1, 3));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 3);
        assert_eq!(source.dataset().len(), 3);
        assert_eq!(
            source.last_merge(),
            Some(MergeStats {
                added: 1,
                updated: 1,
                removed: 0,
                total: 3
            })
        );
    }

    #[tokio::test]
    async fn test_refresh_fetches_and_merges() {
        let (source, transport) = source(RefreshPolicy::Manual, MergeOptions::merge("vehicle_id"));
        let first = source.refresh().await.unwrap();
        assert_eq!(first.added, 2);

        // Served from cache, merged as an update of the same keys.
        let second = source.refresh().await.unwrap();
        assert_eq!((second.added, second.updated, second.total), (0, 2, 2));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.dataset(), vehicles());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_policy_bypasses_cache_each_cycle() {
        let (mut source, transport) = source(
            RefreshPolicy::Poll { interval_ms: 1_000 },
            MergeOptions::append_window().with_window_size(3),
        );
        source.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.dataset().len(), 3);
        assert_eq!(source.poller_state().run_count, 3);

        source.stop();
        assert!(!source.poller_state().is_polling);
    }

    #[tokio::test]
    async fn test_replace_strategy_swaps_dataset() {
        let (source, _) = source(RefreshPolicy::Manual, MergeOptions::replace());
        let source = source.with_dataset(collection(vec![named("old")]));
        source.apply(&collection(vec![named("new-1"), named("new-2")])).unwrap();
        assert_eq!(names(&source.dataset()), vec!["new-1", "new-2"]);
    }

    #[test]
    fn test_non_collection_stream_messages_are_ignored() {
        let (current, _) = watch::channel(collection(vec![named("kept")]));
        let dataset = Dataset {
            options: MergeOptions::replace(),
            current,
            last_merge: Mutex::new(None),
        };
        apply_stream_message(&dataset, &StreamMessage::Text("ping".to_string()));
        apply_stream_message(&dataset, &StreamMessage::Json(serde_json::json!({"type": "Feature"})));
        assert_eq!(names(&dataset.current.borrow()), vec!["kept"]);
        assert_eq!(*dataset.last_merge.lock(), None);

        let batch = serde_json::to_value(collection(vec![named("fresh")])).unwrap();
        apply_stream_message(&dataset, &StreamMessage::Json(batch));
        assert_eq!(names(&dataset.current.borrow()), vec!["fresh"]);
    }
}
