//! Conversion of raw DTDL JSON-LD documents into [`DtdlInterface`].
//!
//! JSON-LD allows several fields to be either a scalar or an array; every
//! reader here accepts both forms. Errors are plain reason strings; the
//! caller attaches the batch index.

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;

use super::{
    ComponentDefinition, DtdlContent, DtdlInterface, DtdlSchema, EnumValue, ObjectField,
    PrimitiveSchema, PropertyDefinition, RelationshipDefinition, TelemetryDefinition,
};
use crate::dtmi::Dtmi;

const SUPPORTED_CONTEXTS: [&str; 2] = ["dtmi:dtdl:context;2", "dtmi:dtdl:context;3"];

pub(super) fn interface(document: &JsonValue) -> Result<DtdlInterface, String> {
    let object = document
        .as_object()
        .ok_or_else(|| "expected a JSON object".to_owned())?;

    let id = object
        .get("@id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| "missing `@id`".to_owned())?;
    let id: Dtmi = id.parse().map_err(|error| format!("{error}"))?;

    let types = string_or_array(object.get("@type"))?;
    if !types.iter().any(|value| value == "Interface") {
        return Err(format!("`{id}` is not an Interface"));
    }

    let contexts = string_or_array(object.get("@context"))?;
    if !contexts
        .iter()
        .any(|context| SUPPORTED_CONTEXTS.contains(&context.as_str()))
    {
        return Err(format!("`{id}` does not declare a supported DTDL context"));
    }

    let extends = string_or_array(object.get("extends"))?
        .into_iter()
        .map(|value| value.parse::<Dtmi>().map_err(|error| format!("{error}")))
        .collect::<Result<Vec<_>, _>>()?;

    let mut contents = Vec::new();
    let mut names = BTreeSet::new();
    if let Some(raw_contents) = object.get("contents") {
        let raw_contents = raw_contents
            .as_array()
            .ok_or_else(|| format!("`{id}` has a non-array `contents`"))?;
        for raw in raw_contents {
            let content = content(raw)?;
            if !names.insert(content.name().to_owned()) {
                return Err(format!(
                    "`{id}` defines content named `{}` more than once",
                    content.name()
                ));
            }
            contents.push(content);
        }
    }

    Ok(DtdlInterface { id, extends, contents })
}

fn content(raw: &JsonValue) -> Result<DtdlContent, String> {
    let object = raw
        .as_object()
        .ok_or_else(|| "content entries must be objects".to_owned())?;
    let name = object
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| "content entry is missing `name`".to_owned())?
        .to_owned();
    let types = string_or_array(object.get("@type"))?;

    // semantic-type adornments ride along in the `@type` array; the first
    // recognized kind wins
    for content_type in &types {
        match content_type.as_str() {
            "Property" => {
                return Ok(DtdlContent::Property(PropertyDefinition {
                    schema: schema(object.get("schema"), &name)?,
                    writable: object
                        .get("writable")
                        .and_then(JsonValue::as_bool)
                        .unwrap_or(true),
                    name,
                }));
            }
            "Relationship" => {
                let target = object
                    .get("target")
                    .and_then(JsonValue::as_str)
                    .map(|target| target.parse::<Dtmi>())
                    .transpose()
                    .map_err(|error| format!("relationship `{name}`: {error}"))?;
                let mut properties = Vec::new();
                if let Some(raw_properties) =
                    object.get("properties").and_then(JsonValue::as_array)
                {
                    for raw_property in raw_properties {
                        match content(raw_property)? {
                            DtdlContent::Property(property) => properties.push(property),
                            other => {
                                return Err(format!(
                                    "relationship `{name}` declares non-property content `{}`",
                                    other.name()
                                ));
                            }
                        }
                    }
                }
                return Ok(DtdlContent::Relationship(RelationshipDefinition {
                    name,
                    target,
                    properties,
                }));
            }
            "Telemetry" => {
                return Ok(DtdlContent::Telemetry(TelemetryDefinition {
                    schema: schema(object.get("schema"), &name)?,
                    name,
                }));
            }
            "Component" => {
                let schema = object
                    .get("schema")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| format!("component `{name}` is missing a DTMI `schema`"))?;
                return Ok(DtdlContent::Component(ComponentDefinition {
                    schema: schema
                        .parse()
                        .map_err(|error| format!("component `{name}`: {error}"))?,
                    name,
                }));
            }
            _ => {}
        }
    }

    Ok(DtdlContent::Unknown {
        content_type: types.first().cloned().unwrap_or_default(),
        name,
    })
}

fn schema(raw: Option<&JsonValue>, owner: &str) -> Result<DtdlSchema, String> {
    match raw {
        Some(JsonValue::String(keyword)) => {
            if let Some(primitive) = PrimitiveSchema::from_keyword(keyword) {
                Ok(DtdlSchema::Primitive(primitive))
            } else if let Ok(dtmi) = keyword.parse::<Dtmi>() {
                Ok(DtdlSchema::Reference(dtmi))
            } else {
                Err(format!("`{owner}` has unknown schema `{keyword}`"))
            }
        }
        Some(JsonValue::Object(complex)) => {
            let types = string_or_array(complex.get("@type"))?;
            match types.first().map(String::as_str) {
                Some("Object") => {
                    let raw_fields = complex
                        .get("fields")
                        .and_then(JsonValue::as_array)
                        .ok_or_else(|| format!("`{owner}` has an Object schema without fields"))?;
                    let mut fields = Vec::new();
                    for raw_field in raw_fields {
                        let field_name = raw_field
                            .get("name")
                            .and_then(JsonValue::as_str)
                            .ok_or_else(|| format!("`{owner}` has an unnamed Object field"))?;
                        fields.push(ObjectField {
                            name: field_name.to_owned(),
                            schema: schema(raw_field.get("schema"), field_name)?,
                        });
                    }
                    Ok(DtdlSchema::Object { fields })
                }
                Some("Map") => {
                    let map_value = complex
                        .get("mapValue")
                        .and_then(|map_value| map_value.get("schema"))
                        .ok_or_else(|| format!("`{owner}` has a Map schema without mapValue"))?;
                    Ok(DtdlSchema::Map {
                        map_value: Box::new(schema(Some(map_value), owner)?),
                    })
                }
                Some("Array") => Ok(DtdlSchema::Array {
                    element_schema: Box::new(schema(complex.get("elementSchema"), owner)?),
                }),
                Some("Enum") => {
                    let value_schema = complex
                        .get("valueSchema")
                        .and_then(JsonValue::as_str)
                        .and_then(PrimitiveSchema::from_keyword)
                        .ok_or_else(|| format!("`{owner}` has an Enum without a valueSchema"))?;
                    let mut enum_values = Vec::new();
                    if let Some(raw_values) =
                        complex.get("enumValues").and_then(JsonValue::as_array)
                    {
                        for raw_value in raw_values {
                            enum_values.push(EnumValue {
                                name: raw_value
                                    .get("name")
                                    .and_then(JsonValue::as_str)
                                    .unwrap_or_default()
                                    .to_owned(),
                                enum_value: raw_value
                                    .get("enumValue")
                                    .cloned()
                                    .unwrap_or(JsonValue::Null),
                            });
                        }
                    }
                    Ok(DtdlSchema::Enum { value_schema, enum_values })
                }
                other => Err(format!(
                    "`{owner}` has unsupported complex schema `{}`",
                    other.unwrap_or("<missing>")
                )),
            }
        }
        _ => Err(format!("`{owner}` is missing a schema")),
    }
}

/// Reads a JSON-LD field that may be a single string or an array of strings.
fn string_or_array(raw: Option<&JsonValue>) -> Result<Vec<String>, String> {
    match raw {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::String(value)) => Ok(vec![value.clone()]),
        Some(JsonValue::Array(values)) => values
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| "expected an array of strings".to_owned())
            })
            .collect(),
        Some(_) => Err("expected a string or an array of strings".to_owned()),
    }
}
