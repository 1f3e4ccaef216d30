//! GEOSYNC Test Utilities
//!
//! Shared test infrastructure for the GEOSYNC workspace:
//! - Proptest generators for features and collections
//! - Fixtures for common datasets
//! - Assertions for merge results

pub use geosync_core::{Feature, FeatureCollection, Properties};

use serde_json::{json, Value};

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating feature data.

    use super::*;
    use proptest::prelude::*;

    /// Property value used as a merge key: small ints, short strings, or
    /// null/missing so key collisions and key-less features are common.
    pub fn arb_key_value() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            4 => (0i64..8).prop_map(|n| Some(json!(n))),
            2 => "[a-d]".prop_map(|s| Some(json!(s))),
            1 => Just(Some(Value::Null)),
            1 => Just(None),
        ]
    }

    /// Epoch-ms timestamp within a ten minute span, or none.
    pub fn arb_timestamp() -> impl Strategy<Value = Option<i64>> {
        prop_oneof![
            4 => (1_700_000_000_000i64..1_700_000_600_000).prop_map(Some),
            1 => Just(None),
        ]
    }

    /// Point feature with an optional `id` property, an optional `ts`
    /// property and a random `value`.
    pub fn arb_feature() -> impl Strategy<Value = Feature> {
        (arb_key_value(), arb_timestamp(), any::<i32>(), -180.0f64..180.0, -90.0f64..90.0)
            .prop_map(|(key, ts, value, lon, lat)| {
                let mut feature = Feature::new(Properties::new())
                    .with_geometry(json!({"type": "Point", "coordinates": [lon, lat]}))
                    .with_property("value", value);
                if let Some(key) = key {
                    feature = feature.with_property("id", key);
                }
                if let Some(ts) = ts {
                    feature = feature.with_property("ts", ts);
                }
                feature
            })
    }

    pub fn arb_collection(max_len: usize) -> impl Strategy<Value = FeatureCollection> {
        proptest::collection::vec(arb_feature(), 0..=max_len).prop_map(FeatureCollection::new)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Hand-built datasets.

    use super::*;

    /// Point feature with properties `{key: id, v: value}`.
    pub fn keyed(key: &str, id: impl Into<Value>, value: impl Into<Value>) -> Feature {
        Feature::new(Properties::new())
            .with_geometry(json!({"type": "Point", "coordinates": [0.0, 0.0]}))
            .with_property(key, id)
            .with_property("v", value)
    }

    /// Feature carrying a timestamp in `field`.
    pub fn stamped(name: &str, field: &str, ts: i64) -> Feature {
        Feature::new(Properties::new())
            .with_property("name", name)
            .with_property(field, ts)
    }

    /// Feature with only a name property.
    pub fn named(name: &str) -> Feature {
        Feature::new(Properties::new()).with_property("name", name)
    }

    pub fn collection(features: Vec<Feature>) -> FeatureCollection {
        FeatureCollection::new(features)
    }

    /// Vehicle positions as a live feed would publish them.
    pub fn vehicles() -> FeatureCollection {
        FeatureCollection::new(vec![
            Feature::new(Properties::new())
                .with_id("bus-1")
                .with_geometry(json!({"type": "Point", "coordinates": [-122.41, 37.77]}))
                .with_property("vehicle_id", "bus-1")
                .with_property("updated_at", 1_700_000_000_000i64),
            Feature::new(Properties::new())
                .with_id("bus-2")
                .with_geometry(json!({"type": "Point", "coordinates": [-122.42, 37.78]}))
                .with_property("vehicle_id", "bus-2")
                .with_property("updated_at", 1_700_000_005_000i64),
        ])
    }

    /// Serialized body of [`vehicles`].
    pub fn vehicles_json() -> String {
        serde_json::to_string(&vehicles()).unwrap_or_default()
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertions.

    use super::*;

    /// Names (the `name` property) of every feature, in order.
    pub fn names(collection: &FeatureCollection) -> Vec<String> {
        collection
            .features
            .iter()
            .filter_map(|f| f.property("name").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Panics unless the timestamps in `field` are non-increasing, with
    /// timestamp-less features only at the tail.
    pub fn assert_sorted_desc(collection: &FeatureCollection, field: &str) {
        let stamps: Vec<Option<i64>> = collection
            .features
            .iter()
            .map(|f| f.timestamp_ms(field))
            .collect();
        for pair in stamps.windows(2) {
            match (pair[0], pair[1]) {
                (Some(a), Some(b)) => assert!(a >= b, "not descending: {:?}", stamps),
                (None, Some(_)) => panic!("untimestamped feature before timestamped: {:?}", stamps),
                _ => {}
            }
        }
    }
}
