//! Relationship edges between twins.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::twin::Etag;

/// A relationship as exchanged with callers: system keys plus an arbitrary
/// property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicRelationship {
    #[serde(rename = "$relationshipId")]
    pub id: String,
    #[serde(rename = "$sourceId")]
    pub source_id: String,
    #[serde(rename = "$targetId")]
    pub target_id: String,
    #[serde(rename = "$relationshipName")]
    pub name: String,
    #[serde(rename = "$etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<Etag>,
    #[serde(flatten)]
    pub properties: JsonMap<String, JsonValue>,
}

impl BasicRelationship {
    /// # Errors
    ///
    /// Returns a reason string when a system key is missing or not a string.
    pub fn from_value(value: &JsonValue) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|error| error.to_string())
    }

    #[must_use]
    pub fn into_value(self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
