//! GeoJSON feature types and payload validation.
//!
//! Only the parts of RFC 7946 that the sync layer depends on are typed:
//! the `type` tags, the `features` array and each feature's `properties`.
//! Geometry and foreign members are carried through untouched as JSON.

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Feature property bag.
pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
enum FeatureTag {
    #[default]
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
enum CollectionTag {
    #[default]
    FeatureCollection,
}

/// A single geometry + properties record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default)]
    kind: FeatureTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Properties,
    /// Members RFC 7946 leaves open (e.g. `bbox`), preserved verbatim.
    #[serde(flatten)]
    pub foreign_members: Map<String, Value>,
}

impl Feature {
    pub fn new(properties: Properties) -> Self {
        Self {
            kind: FeatureTag::Feature,
            id: None,
            geometry: None,
            properties,
            foreign_members: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_geometry(mut self, geometry: Value) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Property value, treating an explicit JSON `null` as absent.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).filter(|v| !v.is_null())
    }

    /// Read a property as epoch milliseconds.
    ///
    /// Numbers are taken as milliseconds. Strings may be numeric or
    /// RFC 3339. Anything else counts as "no timestamp".
    pub fn timestamp_ms(&self, field: &str) -> Option<i64> {
        match self.property(field)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => parse_timestamp(s),
            _ => None,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(ms) = raw.parse::<f64>() {
        if ms.is_finite() {
            return Some(ms as i64);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Properties, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Properties>::deserialize(deserializer)?.unwrap_or_default())
}

/// An ordered list of features.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default)]
    kind: CollectionTag,
    pub features: Vec<Feature>,
    #[serde(flatten)]
    pub foreign_members: Map<String, Value>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: CollectionTag::FeatureCollection,
            features,
            foreign_members: Map::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Validate and convert an arbitrary JSON document.
    ///
    /// The structural checks run before typed deserialization so the error
    /// names the offending path instead of a serde position.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        validate_collection(&value)?;
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed {
            reason: e.to_string(),
        })
    }

    /// Parse and validate a raw response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| ValidationError::Malformed {
            reason: e.to_string(),
        })?;
        Self::from_value(value)
    }

    pub fn from_json_str(body: &str) -> Result<Self, ValidationError> {
        Self::from_slice(body.as_bytes())
    }
}

impl From<Vec<Feature>> for FeatureCollection {
    fn from(features: Vec<Feature>) -> Self {
        Self::new(features)
    }
}

fn validate_collection(value: &Value) -> Result<(), ValidationError> {
    let root = value.as_object().ok_or_else(|| ValidationError::NotAnObject {
        path: "$".to_string(),
    })?;
    expect_type(root, "type", "FeatureCollection")?;

    let features = match root.get("features") {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(ValidationError::TypeMismatch {
                path: "features".to_string(),
                expected: "array",
                found: json_kind(other).to_string(),
            })
        }
        None => {
            return Err(ValidationError::MissingField {
                path: "features".to_string(),
            })
        }
    };

    for (index, feature) in features.iter().enumerate() {
        let obj = feature
            .as_object()
            .ok_or_else(|| ValidationError::NotAnObject {
                path: format!("features[{}]", index),
            })?;
        expect_type(obj, &format!("features[{}].type", index), "Feature")?;
        if let Some(props) = obj.get("properties") {
            if !props.is_object() && !props.is_null() {
                return Err(ValidationError::TypeMismatch {
                    path: format!("features[{}].properties", index),
                    expected: "object or null",
                    found: json_kind(props).to_string(),
                });
            }
        }
    }
    Ok(())
}

fn expect_type(
    obj: &Map<String, Value>,
    path: &str,
    expected: &'static str,
) -> Result<(), ValidationError> {
    match obj.get("type") {
        Some(Value::String(tag)) if tag == expected => Ok(()),
        Some(other) => Err(ValidationError::TypeMismatch {
            path: path.to_string(),
            expected,
            found: match other {
                Value::String(s) => s.clone(),
                v => json_kind(v).to_string(),
            },
        }),
        None => Err(ValidationError::MissingField {
            path: path.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_collection_round_trips_foreign_members() {
        let doc = json!({
            "type": "FeatureCollection",
            "bbox": [0, 0, 1, 1],
            "features": [
                {
                    "type": "Feature",
                    "id": 7,
                    "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
                    "properties": {"name": "a"}
                }
            ]
        });
        let fc = FeatureCollection::from_value(doc.clone()).unwrap();
        assert_eq!(fc.len(), 1);
        assert_eq!(fc.features[0].id, Some(json!(7)));
        assert_eq!(fc.foreign_members.get("bbox"), Some(&json!([0, 0, 1, 1])));
        assert_eq!(serde_json::to_value(&fc).unwrap(), doc);
    }

    #[test]
    fn test_null_properties_become_empty() {
        let fc = FeatureCollection::from_value(json!({
            "type": "FeatureCollection",
            "features": [{"type": "Feature", "geometry": null, "properties": null}]
        }))
        .unwrap();
        assert!(fc.features[0].properties.is_empty());
    }

    #[test]
    fn test_rejects_wrong_root_type() {
        let err = FeatureCollection::from_value(json!({"type": "Feature", "features": []}))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                path: "type".to_string(),
                expected: "FeatureCollection",
                found: "Feature".to_string(),
            }
        );
    }

    #[test]
    fn test_rejects_missing_features() {
        let err = FeatureCollection::from_value(json!({"type": "FeatureCollection"})).unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { ref path } if path == "features"));
    }

    #[test]
    fn test_rejects_bad_feature_entry() {
        let err = FeatureCollection::from_value(json!({
            "type": "FeatureCollection",
            "features": [{"type": "Feature"}, {"type": "Point"}]
        }))
        .unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { ref path, .. } if path == "features[1].type"));
    }

    #[test]
    fn test_rejects_non_json_body() {
        let err = FeatureCollection::from_slice(b"<html>").unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { .. }));
    }

    #[test]
    fn test_timestamp_parsing() {
        let f = Feature::new(Properties::new())
            .with_property("n", 1_700_000_000_000i64)
            .with_property("s", "1700000000000")
            .with_property("iso", "2023-11-14T22:13:20Z")
            .with_property("bad", "yesterday")
            .with_property("nil", Value::Null);
        assert_eq!(f.timestamp_ms("n"), Some(1_700_000_000_000));
        assert_eq!(f.timestamp_ms("s"), Some(1_700_000_000_000));
        assert_eq!(f.timestamp_ms("iso"), Some(1_700_000_000_000));
        assert_eq!(f.timestamp_ms("bad"), None);
        assert_eq!(f.timestamp_ms("nil"), None);
        assert_eq!(f.timestamp_ms("missing"), None);
    }
}
