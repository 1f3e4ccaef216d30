//! Merge strategies for folding an incoming batch into an existing dataset.
//!
//! Merging is pure and synchronous. The only ambient input is "now", used by
//! the time window of `append-window`; [`merge_at`] takes it explicitly.
//!
//! | strategy        | result                                                 |
//! |-----------------|--------------------------------------------------------|
//! | `replace`       | the incoming batch verbatim                            |
//! | `merge`         | keyed upsert on `properties[update_key]`               |
//! | `append-window` | concatenation, trimmed by age and/or count             |

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use geosync_core::{Feature, FeatureCollection, MergeError, TimestampMs};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Which merge algorithm to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MergeStrategy {
    Replace,
    Merge,
    AppendWindow,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
            Self::AppendWindow => "append-window",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(Self::Replace),
            "merge" => Ok(Self::Merge),
            "append-window" => Ok(Self::AppendWindow),
            other => Err(MergeError::UnknownStrategy(other.to_string())),
        }
    }
}

impl TryFrom<String> for MergeStrategy {
    type Error = MergeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MergeStrategy> for String {
    fn from(strategy: MergeStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

/// Strategy plus its strategy-specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    /// Property that identifies a feature (`merge`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_key: Option<String>,
    /// Keep at most this many features (`append-window`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<usize>,
    /// Drop features older than this many ms (`append-window`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_duration_ms: Option<u64>,
    /// Property holding each feature's timestamp (`append-window`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_field: Option<String>,
}

impl MergeOptions {
    fn with_strategy(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            update_key: None,
            window_size: None,
            window_duration_ms: None,
            timestamp_field: None,
        }
    }

    pub fn replace() -> Self {
        Self::with_strategy(MergeStrategy::Replace)
    }

    pub fn merge(update_key: impl Into<String>) -> Self {
        Self {
            update_key: Some(update_key.into()),
            ..Self::with_strategy(MergeStrategy::Merge)
        }
    }

    pub fn append_window() -> Self {
        Self::with_strategy(MergeStrategy::AppendWindow)
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = Some(size);
        self
    }

    pub fn with_window_duration_ms(mut self, duration_ms: u64) -> Self {
        self.window_duration_ms = Some(duration_ms);
        self
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    /// Check strategy-specific requirements without merging anything.
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.strategy == MergeStrategy::Merge {
            match self.update_key.as_deref() {
                Some(key) if !key.is_empty() => {}
                _ => return Err(MergeError::MissingUpdateKey),
            }
        }
        Ok(())
    }
}

/// Merged dataset plus per-strategy counters.
///
/// `total == data.features.len()` always holds; the other counters are only
/// meaningful for the strategy that produced them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeResult {
    pub data: FeatureCollection,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub total: usize,
}

/// Merge using the current wall-clock time.
pub fn merge(
    existing: &FeatureCollection,
    incoming: &FeatureCollection,
    options: &MergeOptions,
) -> Result<MergeResult, MergeError> {
    merge_at(existing, incoming, options, Utc::now().timestamp_millis())
}

/// Merge with an explicit "now" for the time window.
pub fn merge_at(
    existing: &FeatureCollection,
    incoming: &FeatureCollection,
    options: &MergeOptions,
    now_ms: TimestampMs,
) -> Result<MergeResult, MergeError> {
    options.validate()?;

    let result = match options.strategy {
        MergeStrategy::Replace => replace(existing, incoming),
        MergeStrategy::Merge => {
            let key = options.update_key.as_deref().unwrap_or_default();
            merge_by_key(existing, incoming, key)
        }
        MergeStrategy::AppendWindow => append_window(existing, incoming, options, now_ms),
    };
    Ok(result)
}

fn replace(existing: &FeatureCollection, incoming: &FeatureCollection) -> MergeResult {
    MergeResult {
        data: incoming.clone(),
        added: incoming.len(),
        updated: 0,
        removed: existing.len(),
        total: incoming.len(),
    }
}

/// Identity of a feature under `key`. Strings and numbers stay distinct
/// because the key is the JSON rendering of the value.
fn feature_key(feature: &Feature, key: &str) -> Option<String> {
    feature.property(key).map(|value| value.to_string())
}

fn merge_by_key(
    existing: &FeatureCollection,
    incoming: &FeatureCollection,
    key: &str,
) -> MergeResult {
    let mut index: IndexMap<String, Feature> = IndexMap::with_capacity(existing.len());
    for feature in &existing.features {
        if let Some(id) = feature_key(feature, key) {
            index.insert(id, feature.clone());
        }
    }

    let mut added = 0;
    let mut updated = 0;
    for feature in &incoming.features {
        let Some(id) = feature_key(feature, key) else {
            continue;
        };
        // IndexMap keeps the original slot on overwrite.
        if index.insert(id, feature.clone()).is_some() {
            updated += 1;
        } else {
            added += 1;
        }
    }

    let features: Vec<Feature> = index.into_values().collect();
    let total = features.len();
    MergeResult {
        data: FeatureCollection::new(features),
        added,
        updated,
        removed: 0,
        total,
    }
}

fn append_window(
    existing: &FeatureCollection,
    incoming: &FeatureCollection,
    options: &MergeOptions,
    now_ms: TimestampMs,
) -> MergeResult {
    let mut features: Vec<Feature> = existing
        .features
        .iter()
        .chain(incoming.features.iter())
        .cloned()
        .collect();
    let field = options.timestamp_field.as_deref();

    if let (Some(duration), Some(field)) = (options.window_duration_ms, field) {
        let cutoff = now_ms.saturating_sub(i64::try_from(duration).unwrap_or(i64::MAX));
        features.retain(|f| f.timestamp_ms(field).map_or(true, |ts| ts >= cutoff));
    }

    if let Some(size) = options.window_size {
        match field {
            Some(field) => {
                // Newest first, timestamp-less features last, ties keep order.
                features.sort_by_cached_key(|f| {
                    let ts = f.timestamp_ms(field);
                    (ts.is_none(), Reverse(ts))
                });
                features.truncate(size);
            }
            None => {
                // Without timestamps, arrival order is the only recency signal.
                let excess = features.len().saturating_sub(size);
                features.drain(..excess);
            }
        }
    }

    let prior = existing.len();
    let total = features.len();
    MergeResult {
        data: FeatureCollection::new(features),
        added: total.saturating_sub(prior),
        updated: 0,
        removed: prior.saturating_sub(total),
        total,
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use geosync_test_utils::assertions::assert_sorted_desc;
    use geosync_test_utils::generators::arb_collection;
    use proptest::prelude::*;
    use std::collections::HashSet;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_replace_is_incoming(existing in arb_collection(12), incoming in arb_collection(12)) {
            let result = merge(&existing, &incoming, &MergeOptions::replace()).unwrap();
            prop_assert_eq!(&result.data, &incoming);
            prop_assert_eq!(result.added, incoming.len());
            prop_assert_eq!(result.removed, existing.len());
            prop_assert_eq!(result.updated, 0);
        }

        #[test]
        fn prop_merge_has_unique_non_null_keys(existing in arb_collection(12), incoming in arb_collection(12)) {
            let result = merge(&existing, &incoming, &MergeOptions::merge("id")).unwrap();
            prop_assert_eq!(result.total, result.data.len());

            let keys: Vec<String> = result
                .data
                .features
                .iter()
                .map(|f| f.property("id").map(|v| v.to_string()))
                .collect::<Option<Vec<_>>>()
                .expect("every merged feature has a key");
            let unique: HashSet<&String> = keys.iter().collect();
            prop_assert_eq!(unique.len(), keys.len());

            let incoming_keys: HashSet<String> = incoming
                .features
                .iter()
                .filter_map(|f| f.property("id").map(|v| v.to_string()))
                .collect();
            for feature in &result.data.features {
                let key = feature.property("id").map(|v| v.to_string()).unwrap_or_default();
                // The surviving version of an incoming key is the last incoming one.
                if incoming_keys.contains(&key) {
                    let last = incoming
                        .features
                        .iter()
                        .rev()
                        .find(|f| f.property("id").map(|v| v.to_string()) == Some(key.clone()));
                    prop_assert_eq!(Some(feature), last);
                }
            }
        }

        #[test]
        fn prop_append_window_respects_size(
            existing in arb_collection(12),
            incoming in arb_collection(12),
            size in 0usize..10,
        ) {
            let options = MergeOptions::append_window()
                .with_window_size(size)
                .with_timestamp_field("ts");
            let result = merge_at(&existing, &incoming, &options, 1_700_000_600_000).unwrap();
            prop_assert!(result.total <= size);
            prop_assert_eq!(result.total, result.data.len());
            prop_assert_eq!(
                result.added as i64 - result.removed as i64,
                result.total as i64 - existing.len() as i64
            );
            assert_sorted_desc(&result.data, "ts");
        }
    }
}
