//! Instance validation of twins and relationships against DTDL models.
//!
//! Every function here is pure: the caller resolves models (and component
//! schema models) through the catalog and hands over the flattened views.
//! Failures are collected rather than short-circuited, so one error report
//! names every offending property path.

use std::collections::BTreeMap;

use error_stack::Report;
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use twin_types::{
    DigitalTwin,
    model::{DtdlSchema, FlattenedModel, PrimitiveSchema, RelationshipDefinition},
};

/// A mutation failed validation against the model catalog.
///
/// The display output enumerates every offending path.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("validation failed: {}", problems.join("; "))]
#[must_use]
pub struct ValidationFailed {
    pub problems: Vec<String>,
}

impl ValidationFailed {
    fn from_problems(problems: Vec<String>) -> Option<Report<Self>> {
        if problems.is_empty() {
            None
        } else {
            Some(Report::new(Self { problems }))
        }
    }
}

/// Validates a full twin body against its flattened model.
///
/// `component_models` maps component names declared on the model to the
/// flattened view of the component's schema model.
///
/// # Errors
///
/// Returns a single [`ValidationFailed`] report naming every offending
/// property path.
pub fn validate_twin(
    twin: &DigitalTwin,
    model: &FlattenedModel,
    component_models: &BTreeMap<String, FlattenedModel>,
) -> Result<(), Report<ValidationFailed>> {
    let mut problems = Vec::new();
    for (name, value) in twin.properties() {
        validate_member(name, value, model, component_models, &mut problems);
    }
    ValidationFailed::from_problems(problems).map_or(Ok(()), Err)
}

/// Validates a component document against the component's schema model.
///
/// # Errors
///
/// Returns [`ValidationFailed`] naming every offending path.
pub fn validate_component(
    component: &JsonMap<String, JsonValue>,
    component_model: &FlattenedModel,
) -> Result<(), Report<ValidationFailed>> {
    let mut problems = Vec::new();
    for (name, value) in component {
        if name.starts_with('$') {
            continue;
        }
        validate_member(name, value, component_model, &BTreeMap::new(), &mut problems);
    }
    ValidationFailed::from_problems(problems).map_or(Ok(()), Err)
}

/// Validates a relationship's property bag against its declaration.
///
/// # Errors
///
/// Returns [`ValidationFailed`] naming every offending path.
pub fn validate_relationship_properties(
    properties: &JsonMap<String, JsonValue>,
    declaration: &RelationshipDefinition,
) -> Result<(), Report<ValidationFailed>> {
    let mut problems = Vec::new();
    for (name, value) in properties {
        if name.starts_with('$') {
            continue;
        }
        match declaration
            .properties
            .iter()
            .find(|property| property.name == *name)
        {
            Some(property) => check_value(value, &property.schema, name, &mut problems),
            None => problems.push(format!(
                "`{name}` is not defined on relationship `{}`",
                declaration.name
            )),
        }
    }
    ValidationFailed::from_problems(problems).map_or(Ok(()), Err)
}

fn validate_member(
    name: &str,
    value: &JsonValue,
    model: &FlattenedModel,
    component_models: &BTreeMap<String, FlattenedModel>,
    problems: &mut Vec<String>,
) {
    if let Some(property) = model.properties.get(name) {
        check_value(value, &property.schema, name, problems);
    } else if model.components.contains_key(name) {
        match (value.as_object(), component_models.get(name)) {
            (Some(component), Some(component_model)) => {
                for (member, member_value) in component {
                    if member.starts_with('$') {
                        continue;
                    }
                    let path = format!("{name}.{member}");
                    match component_model.properties.get(member) {
                        Some(property) => {
                            check_value(member_value, &property.schema, &path, problems);
                        }
                        None => problems.push(format!("`{path}` is not defined by the model")),
                    }
                }
            }
            (None, _) => problems.push(format!("`{name}` must be an object component")),
            (_, None) => problems.push(format!(
                "`{name}` references a component schema that could not be resolved"
            )),
        }
    } else if model.telemetries.contains_key(name) {
        problems.push(format!("`{name}` is a telemetry and cannot be written"));
    } else {
        problems.push(format!("`{name}` is not defined by the model"));
    }
}

fn check_value(value: &JsonValue, schema: &DtdlSchema, path: &str, problems: &mut Vec<String>) {
    match schema {
        DtdlSchema::Primitive(primitive) => check_primitive(value, *primitive, path, problems),
        DtdlSchema::Object { fields } => {
            let Some(object) = value.as_object() else {
                problems.push(format!("`{path}` must be an object"));
                return;
            };
            for (member, member_value) in object {
                let member_path = format!("{path}.{member}");
                match fields.iter().find(|field| field.name == *member) {
                    Some(field) => {
                        check_value(member_value, &field.schema, &member_path, problems);
                    }
                    None => problems.push(format!("`{member_path}` is not a declared field")),
                }
            }
        }
        DtdlSchema::Map { map_value } => {
            let Some(object) = value.as_object() else {
                problems.push(format!("`{path}` must be a map"));
                return;
            };
            for (key, entry) in object {
                check_value(entry, map_value, &format!("{path}.{key}"), problems);
            }
        }
        DtdlSchema::Array { element_schema } => {
            let Some(elements) = value.as_array() else {
                problems.push(format!("`{path}` must be an array"));
                return;
            };
            for (index, element) in elements.iter().enumerate() {
                check_value(element, element_schema, &format!("{path}[{index}]"), problems);
            }
        }
        DtdlSchema::Enum { enum_values, .. } => {
            if !enum_values
                .iter()
                .any(|enum_value| enum_value.enum_value == *value)
            {
                problems.push(format!("`{path}` is not one of the declared enum values"));
            }
        }
        // named schema references are opaque to instance validation
        DtdlSchema::Reference(_) => {}
    }
}

fn check_primitive(
    value: &JsonValue,
    primitive: PrimitiveSchema,
    path: &str,
    problems: &mut Vec<String>,
) {
    let ok = match primitive {
        PrimitiveSchema::Boolean => value.is_boolean(),
        PrimitiveSchema::Double | PrimitiveSchema::Float => value.is_number(),
        // integral schemas tolerate numeric coercion as long as the value
        // has no fractional part
        PrimitiveSchema::Integer | PrimitiveSchema::Long => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|float| float.fract() == 0.0)
        }
        PrimitiveSchema::DateTime => value
            .as_str()
            .is_some_and(|text| OffsetDateTime::parse(text, &Rfc3339).is_ok()),
        PrimitiveSchema::Date
        | PrimitiveSchema::Duration
        | PrimitiveSchema::String
        | PrimitiveSchema::Time => value.is_string(),
    };
    if !ok {
        problems.push(format!(
            "`{path}` is not a valid `{}` value",
            primitive.keyword()
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use twin_types::{
        DigitalTwin, DtdlInterface, flatten_contents,
        model::FlattenedModel,
    };

    use super::{validate_relationship_properties, validate_twin};

    fn flattened(contents: serde_json::Value) -> FlattenedModel {
        let interface = DtdlInterface::from_document(
            &json!({
                "@id": "dtmi:com:example:Room;1",
                "@type": "Interface",
                "@context": "dtmi:dtdl:context;3",
                "contents": contents,
            }),
            0,
        )
        .expect("valid DTDL interface");
        flatten_contents(&interface, [])
    }

    fn twin(body: serde_json::Value) -> DigitalTwin {
        DigitalTwin::from_value(body).expect("twin bodies are objects")
    }

    #[test]
    fn accepts_conforming_twin() {
        let model = flattened(json!([
            { "@type": "Property", "name": "temperature", "schema": "double" },
            { "@type": "Property", "name": "occupied", "schema": "boolean" },
            {
                "@type": "Property",
                "name": "tags",
                "schema": { "@type": "Map", "mapValue": { "name": "tag", "schema": "string" } }
            },
        ]));
        let twin = twin(json!({
            "$dtId": "room-1",
            "$metadata": { "$model": "dtmi:com:example:Room;1" },
            "temperature": 20.1,
            "occupied": true,
            "tags": { "floor": "1" },
        }));

        validate_twin(&twin, &model, &BTreeMap::new()).expect("twin conforms to model");
    }

    #[test]
    fn collects_every_offending_path() {
        let model = flattened(json!([
            { "@type": "Property", "name": "temperature", "schema": "double" },
        ]));
        let twin = twin(json!({
            "$dtId": "room-1",
            "$metadata": { "$model": "dtmi:com:example:Room;1" },
            "temperature": "warm",
            "undeclared": 1,
        }));

        let report = validate_twin(&twin, &model, &BTreeMap::new())
            .expect_err("both properties are invalid");
        let message = report.to_string();
        assert!(message.contains("temperature"), "{message}");
        assert!(message.contains("undeclared"), "{message}");
    }

    #[test]
    fn integer_schema_accepts_integral_floats_only() {
        let model = flattened(json!([
            { "@type": "Property", "name": "count", "schema": "integer" },
        ]));

        validate_twin(
            &twin(json!({ "$dtId": "t", "count": 3.0 })),
            &model,
            &BTreeMap::new(),
        )
        .expect("3.0 coerces to an integer");

        validate_twin(
            &twin(json!({ "$dtId": "t", "count": 3.5 })),
            &model,
            &BTreeMap::new(),
        )
        .expect_err("3.5 does not coerce to an integer");
    }

    #[test]
    fn enum_values_are_checked() {
        let model = flattened(json!([
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
            },
        ]));

        validate_twin(
            &twin(json!({ "$dtId": "t", "state": "on" })),
            &model,
            &BTreeMap::new(),
        )
        .expect("declared enum value");
        validate_twin(
            &twin(json!({ "$dtId": "t", "state": "standby" })),
            &model,
            &BTreeMap::new(),
        )
        .expect_err("undeclared enum value");
    }

    #[test]
    fn component_members_validate_against_component_model() {
        let model = flattened(json!([
            { "@type": "Component", "name": "thermostat", "schema": "dtmi:com:example:Thermostat;1" },
        ]));
        let component_model = flattened(json!([
            { "@type": "Property", "name": "setPoint", "schema": "double" },
        ]));
        let component_models: BTreeMap<_, _> =
            [("thermostat".to_owned(), component_model)].into();

        validate_twin(
            &twin(json!({
                "$dtId": "t",
                "thermostat": { "$metadata": {}, "setPoint": 21.0 },
            })),
            &model,
            &component_models,
        )
        .expect("component conforms");

        let report = validate_twin(
            &twin(json!({
                "$dtId": "t",
                "thermostat": { "$metadata": {}, "setPoint": "hot" },
            })),
            &model,
            &component_models,
        )
        .expect_err("component member has the wrong type");
        assert!(report.to_string().contains("thermostat.setPoint"));
    }

    #[test]
    fn relationship_properties_validate_against_declaration() {
        let model = flattened(json!([
            {
                "@type": "Relationship",
                "name": "contains",
                "properties": [
                    { "@type": "Property", "name": "since", "schema": "string" }
                ]
            },
        ]));
        let declaration = model
            .declares_relationship("contains")
            .expect("declared on the model");

        let mut properties = serde_json::Map::new();
        properties.insert("since".to_owned(), json!("2024-05-01"));
        validate_relationship_properties(&properties, declaration)
            .expect("property bag conforms");

        properties.insert("weight".to_owned(), json!(12));
        validate_relationship_properties(&properties, declaration)
            .expect_err("undeclared relationship property");
    }
}
