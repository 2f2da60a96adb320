//! Digital twin documents and optimistic-concurrency tokens.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::dtmi::Dtmi;

pub const DT_ID: &str = "$dtId";
pub const ETAG: &str = "$etag";
pub const METADATA: &str = "$metadata";
pub const MODEL: &str = "$model";
pub const LAST_UPDATED_ON: &str = "lastUpdatedOn";
pub const SOURCE_TIME: &str = "sourceTime";

/// A weak entity tag derived from a per-row write sequence.
///
/// The token is a v5 UUID over `<key>:<sequence>` rather than a timestamp,
/// so concurrent writers on skewed clocks still produce distinct tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(String);

impl Etag {
    #[must_use]
    pub fn from_write_sequence(key: &str, sequence: u64) -> Self {
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{key}:{sequence}").as_bytes());
        Self(format!("W/\"{uuid}\""))
    }

    /// Wraps an already-formatted tag read back from the store.
    #[must_use]
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `If-Match` comparison; `*` matches any tag.
    #[must_use]
    pub fn matches(&self, if_match: &str) -> bool {
        if_match == "*" || if_match == self.0
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// A twin body: a JSON object with `$`-prefixed system keys.
///
/// The wrapper deliberately stays close to the wire shape. Typed accessors
/// cover the system keys; everything else is reachable through
/// [`DigitalTwin::properties`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DigitalTwin(JsonMap<String, JsonValue>);

impl DigitalTwin {
    #[must_use]
    pub const fn new(body: JsonMap<String, JsonValue>) -> Self {
        Self(body)
    }

    /// # Errors
    ///
    /// Returns the original value if it is not a JSON object.
    pub fn from_value(value: JsonValue) -> Result<Self, JsonValue> {
        match value {
            JsonValue::Object(body) => Ok(Self(body)),
            other => Err(other),
        }
    }

    #[must_use]
    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }

    #[must_use]
    pub const fn as_map(&self) -> &JsonMap<String, JsonValue> {
        &self.0
    }

    #[must_use]
    pub fn dt_id(&self) -> Option<&str> {
        self.0.get(DT_ID).and_then(JsonValue::as_str)
    }

    pub fn set_dt_id(&mut self, id: &str) {
        self.0.insert(DT_ID.to_owned(), JsonValue::String(id.to_owned()));
    }

    #[must_use]
    pub fn etag(&self) -> Option<Etag> {
        self.0
            .get(ETAG)
            .and_then(JsonValue::as_str)
            .map(Etag::from_stored)
    }

    pub fn set_etag(&mut self, etag: &Etag) {
        self.0
            .insert(ETAG.to_owned(), JsonValue::String(etag.as_str().to_owned()));
    }

    /// The `$metadata.$model` reference, if present and well-formed.
    #[must_use]
    pub fn model_id(&self) -> Option<Dtmi> {
        self.0
            .get(METADATA)?
            .get(MODEL)?
            .as_str()?
            .parse()
            .ok()
    }

    /// Non-`$` top-level keys, i.e. property and component names.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.0
            .iter()
            .filter(|(key, _)| !key.starts_with('$'))
            .map(|(key, value)| (key.as_str(), value))
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&JsonValue> {
        if name.starts_with('$') {
            return None;
        }
        self.0.get(name)
    }

    /// Writes `$metadata.<name>.lastUpdatedOn` (and `sourceTime` when given),
    /// creating the metadata object as needed. A caller-supplied
    /// `sourceTime` already present for the property is preserved when
    /// `source_time` is `None`.
    pub fn touch_property_metadata(
        &mut self,
        name: &str,
        now: OffsetDateTime,
        source_time: Option<&str>,
    ) {
        let metadata = self
            .0
            .entry(METADATA.to_owned())
            .or_insert_with(|| JsonValue::Object(JsonMap::new()));
        let JsonValue::Object(metadata) = metadata else {
            return;
        };
        let entry = metadata
            .entry(name.to_owned())
            .or_insert_with(|| JsonValue::Object(JsonMap::new()));
        let JsonValue::Object(entry) = entry else {
            return;
        };
        entry.insert(
            LAST_UPDATED_ON.to_owned(),
            JsonValue::String(now.format(&Rfc3339).unwrap_or_default()),
        );
        if let Some(source_time) = source_time {
            entry.insert(
                SOURCE_TIME.to_owned(),
                JsonValue::String(source_time.to_owned()),
            );
        }
    }

    /// The caller-supplied `$metadata.<name>.sourceTime`, if any.
    #[must_use]
    pub fn property_source_time(&self, name: &str) -> Option<&str> {
        self.0
            .get(METADATA)?
            .get(name)?
            .get(SOURCE_TIME)?
            .as_str()
    }

    pub fn remove_property_metadata(&mut self, name: &str) {
        if let Some(JsonValue::Object(metadata)) = self.0.get_mut(METADATA) {
            metadata.remove(name);
        }
    }
}
