//! Parsed DTDL interfaces and the catalog records derived from them.
//!
//! DTDL is JSON-LD, so the wire shape is loose: `extends` may be a string or
//! an array, content `@type`s may be arrays carrying semantic types, and a
//! `schema` may be a primitive keyword, an inline complex schema, or a DTMI
//! reference. The parser normalizes all of that into the typed surface the
//! validator and catalog operate on, while the raw document is kept verbatim
//! for storage.

mod parse;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::dtmi::Dtmi;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("document {index} is not a valid DTDL interface: {reason}")]
#[must_use]
pub struct DtdlParseError {
    pub index: usize,
    pub reason: String,
}

/// A primitive DTDL property schema.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrimitiveSchema {
    Boolean,
    Date,
    DateTime,
    Double,
    Duration,
    Float,
    Integer,
    Long,
    String,
    Time,
}

impl PrimitiveSchema {
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "boolean" => Self::Boolean,
            "date" => Self::Date,
            "dateTime" => Self::DateTime,
            "double" => Self::Double,
            "duration" => Self::Duration,
            "float" => Self::Float,
            "integer" => Self::Integer,
            "long" => Self::Long,
            "string" => Self::String,
            "time" => Self::Time,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "dateTime",
            Self::Double => "double",
            Self::Duration => "duration",
            Self::Float => "float",
            Self::Integer => "integer",
            Self::Long => "long",
            Self::String => "string",
            Self::Time => "time",
        }
    }

    /// Whether values of this schema are numeric after JSON coercion.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Double | Self::Float | Self::Integer | Self::Long)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub schema: DtdlSchema,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub name: String,
    pub enum_value: JsonValue,
}

/// A DTDL property/telemetry schema.
#[derive(Debug, Clone, PartialEq)]
pub enum DtdlSchema {
    Primitive(PrimitiveSchema),
    Object { fields: Vec<ObjectField> },
    Map { map_value: Box<DtdlSchema> },
    Array { element_schema: Box<DtdlSchema> },
    Enum { value_schema: PrimitiveSchema, enum_values: Vec<EnumValue> },
    /// A DTMI reference to a schema defined elsewhere. Opaque to instance
    /// validation.
    Reference(Dtmi),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    pub schema: DtdlSchema,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDefinition {
    pub name: String,
    pub target: Option<Dtmi>,
    pub properties: Vec<PropertyDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryDefinition {
    pub name: String,
    pub schema: DtdlSchema,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDefinition {
    pub name: String,
    pub schema: Dtmi,
}

/// One entry of an interface's `contents` array.
#[derive(Debug, Clone, PartialEq)]
pub enum DtdlContent {
    Property(PropertyDefinition),
    Relationship(RelationshipDefinition),
    Telemetry(TelemetryDefinition),
    Component(ComponentDefinition),
    /// Content with an unrecognized `@type`, preserved so a replace
    /// round-trips the document unchanged.
    Unknown { content_type: String, name: String },
}

impl DtdlContent {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Property(property) => &property.name,
            Self::Relationship(relationship) => &relationship.name,
            Self::Telemetry(telemetry) => &telemetry.name,
            Self::Component(component) => &component.name,
            Self::Unknown { name, .. } => name,
        }
    }
}

/// A parsed DTDL v2/v3 interface.
#[derive(Debug, Clone, PartialEq)]
pub struct DtdlInterface {
    pub id: Dtmi,
    pub extends: Vec<Dtmi>,
    pub contents: Vec<DtdlContent>,
}

impl DtdlInterface {
    /// Parses one DTDL document.
    ///
    /// # Errors
    ///
    /// Returns [`DtdlParseError`] carrying `index` when the document is not
    /// a structurally valid interface.
    pub fn from_document(document: &JsonValue, index: usize) -> Result<Self, DtdlParseError> {
        parse::interface(document).map_err(|reason| DtdlParseError { index, reason })
    }

    /// Every DTMI this interface references: direct `extends`, component
    /// schemas, and relationship targets.
    #[must_use]
    pub fn referenced_dtmis(&self) -> BTreeSet<Dtmi> {
        let mut references: BTreeSet<_> = self.extends.iter().cloned().collect();
        for content in &self.contents {
            match content {
                DtdlContent::Component(component) => {
                    references.insert(component.schema.clone());
                }
                DtdlContent::Relationship(relationship) => {
                    references.extend(relationship.target.clone());
                }
                _ => {}
            }
        }
        references
    }
}

/// A model as returned by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: Dtmi,
    /// The raw DTDL document; only populated when the definition was
    /// requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<JsonValue>,
    /// Flattened `contents` merged over all bases; only populated when
    /// requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Vec<JsonValue>>,
    pub bases: Vec<Dtmi>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub descendants: Vec<Dtmi>,
    pub decommissioned: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub upload_time: OffsetDateTime,
}

/// Computes the transitive ancestor set of `root` over `extends`.
///
/// The traversal is breadth-first with ties at the same depth broken by
/// lexicographic DTMI order, so the persisted `bases` array is deterministic
/// for a given interface set. A parent reachable at several depths is kept
/// at its shallowest occurrence.
///
/// # Errors
///
/// Returns the set of DTMIs that could not be resolved in `interfaces`.
pub fn compute_bases(
    root: &Dtmi,
    interfaces: &BTreeMap<Dtmi, DtdlInterface>,
) -> Result<Vec<Dtmi>, BTreeSet<Dtmi>> {
    let mut bases = Vec::new();
    let mut seen = BTreeSet::new();
    let mut missing = BTreeSet::new();
    seen.insert(root.clone());

    let mut frontier: Vec<Dtmi> = interfaces
        .get(root)
        .map(|interface| interface.extends.clone())
        .unwrap_or_default();

    while !frontier.is_empty() {
        frontier.sort();
        let mut next = Vec::new();
        for parent in frontier {
            if !seen.insert(parent.clone()) {
                continue;
            }
            match interfaces.get(&parent) {
                Some(interface) => next.extend(interface.extends.iter().cloned()),
                None => {
                    missing.insert(parent.clone());
                }
            }
            bases.push(parent);
        }
        frontier = next;
    }

    if missing.is_empty() { Ok(bases) } else { Err(missing) }
}

/// The merged view of an interface's contents over all of its bases, keyed
/// by content name. Derived definitions shadow base definitions.
#[derive(Debug, Default, Clone)]
pub struct FlattenedModel {
    pub properties: BTreeMap<String, PropertyDefinition>,
    pub relationships: BTreeMap<String, RelationshipDefinition>,
    pub components: BTreeMap<String, ComponentDefinition>,
    pub telemetries: BTreeMap<String, TelemetryDefinition>,
}

impl FlattenedModel {
    fn insert(&mut self, content: &DtdlContent) {
        // a redefinition replaces whatever kind the name previously had
        let name = content.name();
        self.properties.remove(name);
        self.relationships.remove(name);
        self.components.remove(name);
        self.telemetries.remove(name);

        match content {
            DtdlContent::Property(property) => {
                self.properties.insert(property.name.clone(), property.clone());
            }
            DtdlContent::Relationship(relationship) => {
                self.relationships
                    .insert(relationship.name.clone(), relationship.clone());
            }
            DtdlContent::Component(component) => {
                self.components.insert(component.name.clone(), component.clone());
            }
            DtdlContent::Telemetry(telemetry) => {
                self.telemetries.insert(telemetry.name.clone(), telemetry.clone());
            }
            DtdlContent::Unknown { .. } => {}
        }
    }

    #[must_use]
    pub fn declares_relationship(&self, name: &str) -> Option<&RelationshipDefinition> {
        self.relationships.get(name)
    }
}

/// Merges `contents` from the given inheritance chain.
///
/// `bases` must be ordered nearest-first (the order produced by
/// [`compute_bases`]); the chain is applied farthest-base first and the
/// interface itself last, so nearer definitions shadow farther ones.
#[must_use]
pub fn flatten_contents<'i>(
    interface: &'i DtdlInterface,
    bases: impl IntoIterator<Item = &'i DtdlInterface>,
) -> FlattenedModel {
    let mut flattened = FlattenedModel::default();
    let chain: Vec<_> = bases.into_iter().collect();
    for base in chain.into_iter().rev() {
        for content in &base.contents {
            flattened.insert(content);
        }
    }
    for content in &interface.contents {
        flattened.insert(content);
    }
    flattened
}

/// Merges raw `contents` arrays over an inheritance chain, farthest base
/// first, de-duplicating by `name` with later entries shadowing earlier
/// ones. Used for the `contents` view on [`ModelRecord`].
#[must_use]
pub fn flatten_raw_contents<'d>(chain: impl IntoIterator<Item = &'d JsonValue>) -> Vec<JsonValue> {
    let mut merged: Vec<JsonValue> = Vec::new();
    for document in chain {
        let Some(contents) = document.get("contents").and_then(JsonValue::as_array) else {
            continue;
        };
        for content in contents {
            let name = content.get("name").and_then(JsonValue::as_str);
            if let Some(name) = name {
                merged.retain(|existing| {
                    existing.get("name").and_then(JsonValue::as_str) != Some(name)
                });
            }
            merged.push(content.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{DtdlContent, DtdlInterface, DtdlSchema, PrimitiveSchema, compute_bases,
                flatten_contents, flatten_raw_contents};
    use crate::dtmi::Dtmi;

    fn dtmi(value: &str) -> Dtmi {
        value.parse().expect("valid DTMI")
    }

    fn interface(id: &str, extends: &[&str], contents: serde_json::Value) -> DtdlInterface {
        DtdlInterface::from_document(
            &json!({
                "@id": id,
                "@type": "Interface",
                "@context": "dtmi:dtdl:context;3",
                "extends": extends,
                "contents": contents,
            }),
            0,
        )
        .expect("valid DTDL interface")
    }

    #[test]
    fn parses_a_full_interface() {
        let parsed = interface(
            "dtmi:com:example:Thermostat;1",
            &["dtmi:com:example:Device;1"],
            json!([
                { "@type": "Property", "name": "temperature", "schema": "double" },
                { "@type": ["Property", "Humidity"], "name": "humidity", "schema": "double" },
                {
                    "@type": "Relationship",
                    "name": "feeds",
                    "target": "dtmi:com:example:Display;1",
                    "properties": [
                        { "@type": "Property", "name": "priority", "schema": "integer" }
                    ]
                },
                { "@type": "Component", "name": "fan", "schema": "dtmi:com:example:Fan;1" },
                { "@type": "Telemetry", "name": "reading", "schema": "double" },
                {
                    "@type": "Property",
                    "name": "state",
                    "schema": {
                        "@type": "Enum",
                        "valueSchema": "string",
                        "enumValues": [
                            { "name": "on", "enumValue": "on" },
                            { "name": "off", "enumValue": "off" }
                        ]
                    }
                }
            ]),
        );

        assert_eq!(parsed.id, dtmi("dtmi:com:example:Thermostat;1"));
        assert_eq!(parsed.extends, vec![dtmi("dtmi:com:example:Device;1")]);
        assert_eq!(parsed.contents.len(), 6);
        assert!(matches!(
            &parsed.contents[0],
            DtdlContent::Property(property)
                if property.schema == DtdlSchema::Primitive(PrimitiveSchema::Double)
        ));

        let references = parsed.referenced_dtmis();
        assert!(references.contains(&dtmi("dtmi:com:example:Device;1")));
        assert!(references.contains(&dtmi("dtmi:com:example:Fan;1")));
        assert!(references.contains(&dtmi("dtmi:com:example:Display;1")));
    }

    #[test]
    fn rejects_duplicate_content_names() {
        let result = DtdlInterface::from_document(
            &json!({
                "@id": "dtmi:com:example:Bad;1",
                "@type": "Interface",
                "@context": "dtmi:dtdl:context;2",
                "contents": [
                    { "@type": "Property", "name": "x", "schema": "string" },
                    { "@type": "Telemetry", "name": "x", "schema": "double" }
                ]
            }),
            3,
        );
        let error = result.expect_err("duplicate names must be rejected");
        assert_eq!(error.index, 3);
        assert!(error.reason.contains('x'), "{}", error.reason);
    }

    #[test]
    fn bases_are_breadth_first_with_lexicographic_ties() {
        // diamond: Leaf extends B and A; both extend Root
        let interfaces: BTreeMap<_, _> = [
            interface("dtmi:ex:Leaf;1", &["dtmi:ex:B;1", "dtmi:ex:A;1"], json!([])),
            interface("dtmi:ex:A;1", &["dtmi:ex:Root;1"], json!([])),
            interface("dtmi:ex:B;1", &["dtmi:ex:Root;1"], json!([])),
            interface("dtmi:ex:Root;1", &[], json!([])),
        ]
        .into_iter()
        .map(|interface| (interface.id.clone(), interface))
        .collect();

        let bases =
            compute_bases(&dtmi("dtmi:ex:Leaf;1"), &interfaces).expect("all ancestors resolve");
        assert_eq!(
            bases,
            vec![dtmi("dtmi:ex:A;1"), dtmi("dtmi:ex:B;1"), dtmi("dtmi:ex:Root;1")]
        );
    }

    #[test]
    fn unresolved_ancestors_are_reported() {
        let interfaces: BTreeMap<_, _> = [interface(
            "dtmi:ex:Leaf;1",
            &["dtmi:ex:Missing;1", "dtmi:ex:AlsoMissing;1"],
            json!([]),
        )]
        .into_iter()
        .map(|interface| (interface.id.clone(), interface))
        .collect();

        let missing = compute_bases(&dtmi("dtmi:ex:Leaf;1"), &interfaces)
            .expect_err("missing ancestors must fail");
        assert_eq!(missing.len(), 2);
        assert!(missing.contains(&dtmi("dtmi:ex:Missing;1")));
    }

    #[test]
    fn derived_contents_shadow_bases() {
        let base = interface(
            "dtmi:ex:Base;1",
            &[],
            json!([
                { "@type": "Property", "name": "shared", "schema": "string" },
                { "@type": "Property", "name": "baseOnly", "schema": "integer" }
            ]),
        );
        let derived = interface(
            "dtmi:ex:Derived;1",
            &["dtmi:ex:Base;1"],
            json!([
                { "@type": "Property", "name": "shared", "schema": "double" }
            ]),
        );

        let flattened = flatten_contents(&derived, [&base]);
        assert_eq!(flattened.properties.len(), 2);
        assert_eq!(
            flattened.properties["shared"].schema,
            DtdlSchema::Primitive(PrimitiveSchema::Double)
        );
    }

    #[test]
    fn raw_contents_merge_dedupes_by_name() {
        let base = json!({ "contents": [
            { "@type": "Property", "name": "shared", "schema": "string" },
            { "@type": "Property", "name": "baseOnly", "schema": "integer" }
        ]});
        let derived = json!({ "contents": [
            { "@type": "Property", "name": "shared", "schema": "double" }
        ]});

        let merged = flatten_raw_contents([&base, &derived]);
        assert_eq!(merged.len(), 2);
        let shared = merged
            .iter()
            .find(|content| content["name"] == "shared")
            .expect("shared kept");
        assert_eq!(shared["schema"], "double");
    }
}
