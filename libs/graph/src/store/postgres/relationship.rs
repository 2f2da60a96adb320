//! The relationship (edge) data plane.
//!
//! Edges carry the relationship name as their label and the full document —
//! system keys included — as properties, so a single edge fetch
//! reconstructs the wire shape without touching its endpoints.

use error_stack::{Report, ResultExt as _};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use twin_types::{BasicRelationship, Dtmi, Etag, MAX_BATCH_SIZE};

use super::{AsClient, PostgresStore, age, twin::apply_patch};
use crate::store::{
    BatchFailure, BatchOperationResult, RelationshipStore,
    error::{
        ArgumentError, DeletionError, DigitalTwinNotFound, InsertionError, PreconditionFailed,
        QueryError, RelationshipNotFound, UpdateError, ValidationFailed,
    },
};

/// The server-owned write sequence stored on the edge.
const SEQUENCE: &str = "$sequence";

fn is_valid_relationship_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && name.chars().all(|char| char.is_ascii_alphanumeric() || char == '_')
}

impl<C: AsClient> PostgresStore<C> {
    async fn fetch_relationship_props(
        &self,
        source_id: &str,
        relationship_id: &str,
    ) -> Result<Option<JsonMap<String, JsonValue>>, Report<QueryError>> {
        let row = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (s:Twin)-[r]->(:Twin) \
             WHERE s['$dtId'] = $source AND r['$relationshipId'] = $id RETURN r",
            &age::params([("source", json!(source_id)), ("id", json!(relationship_id))]),
        )
        .await?;
        Ok(row.and_then(age::graph_element_properties))
    }

    pub(crate) async fn count_relationships(&self) -> Result<u64, Report<QueryError>> {
        let count = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (:Twin)-[r]->(:Twin) RETURN COUNT(r)",
            &JsonMap::new(),
        )
        .await?;
        Ok(count.and_then(|value| value.as_u64()).unwrap_or(0))
    }

    /// Deletes up to `limit` edges. Used by the bulk-delete job's
    /// Relationships phase.
    pub(crate) async fn delete_relationships_batch(
        &mut self,
        limit: usize,
    ) -> Result<u64, Report<DeletionError>> {
        let before = self.count_relationships().await.change_context(DeletionError)?;
        let cypher = format!("MATCH (:Twin)-[r]->(:Twin) WITH r LIMIT {limit} DELETE r");
        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            &cypher,
            &JsonMap::new(),
        )
        .await
        .change_context(DeletionError)?;
        let after = self.count_relationships().await.change_context(DeletionError)?;
        Ok(before.saturating_sub(after))
    }

    /// Checks the relationship declaration on the source model and the
    /// `target` constraint against the target twin's model.
    async fn validate_relationship(
        &self,
        source_model: &Dtmi,
        name: &str,
        target_id: &str,
        properties: &JsonMap<String, JsonValue>,
    ) -> Result<(), Report<ValidationFailed>> {
        let resolved = self
            .resolve_model(source_model)
            .await
            .change_context_lazy(|| ValidationFailed {
                problems: vec![format!("model `{source_model}` could not be resolved")],
            })?
            .ok_or_else(|| {
                Report::new(ValidationFailed {
                    problems: vec![format!("model `{source_model}` does not exist")],
                })
            })?;

        let declaration = resolved
            .flattened
            .declares_relationship(name)
            .ok_or_else(|| {
                Report::new(ValidationFailed {
                    problems: vec![format!(
                        "relationship `{name}` is not declared on `{source_model}` or its bases"
                    )],
                })
            })?;

        if let Some(required_target) = &declaration.target {
            let target_props = self
                .fetch_twin_props(target_id)
                .await
                .change_context_lazy(|| ValidationFailed {
                    problems: vec![format!("target twin `{target_id}` could not be read")],
                })?;
            let target_model = target_props
                .map(twin_types::DigitalTwin::new)
                .as_ref()
                .and_then(twin_types::DigitalTwin::model_id);
            let permitted = match &target_model {
                Some(model) if model == required_target => true,
                Some(model) => self
                    .resolve_model(model)
                    .await
                    .ok()
                    .flatten()
                    .is_some_and(|resolved| resolved.record.bases.contains(required_target)),
                None => false,
            };
            if !permitted {
                return Err(Report::new(ValidationFailed {
                    problems: vec![format!(
                        "relationship `{name}` requires a target of model `{required_target}`"
                    )],
                }));
            }
        }

        twin_validation::validate_relationship_properties(properties, declaration)?;
        Ok(())
    }
}

impl<C: AsClient> RelationshipStore for PostgresStore<C> {
    #[tracing::instrument(level = "info", skip(self, body))]
    async fn create_or_replace_relationship(
        &mut self,
        source_id: &str,
        relationship_id: &str,
        body: JsonValue,
        if_none_match: Option<&str>,
    ) -> Result<BasicRelationship, Report<InsertionError>> {
        let mut document = body.as_object().cloned().ok_or_else(|| {
            Report::new(ArgumentError::new("a relationship must be a JSON object"))
                .change_context(InsertionError)
        })?;
        document.insert("$relationshipId".to_owned(), json!(relationship_id));
        document.insert("$sourceId".to_owned(), json!(source_id));

        let relationship =
            BasicRelationship::from_value(&JsonValue::Object(document)).map_err(|reason| {
                Report::new(ArgumentError::new(reason)).change_context(InsertionError)
            })?;
        if !is_valid_relationship_name(&relationship.name) {
            return Err(Report::new(ArgumentError::new(format!(
                "`{}` is not a valid relationship name",
                relationship.name
            )))
            .change_context(InsertionError));
        }

        let source = self
            .fetch_twin_props(source_id)
            .await
            .change_context(InsertionError)?
            .ok_or_else(|| {
                Report::new(DigitalTwinNotFound { id: source_id.to_owned() })
                    .change_context(InsertionError)
            })?;
        self.fetch_twin_props(&relationship.target_id)
            .await
            .change_context(InsertionError)?
            .ok_or_else(|| {
                Report::new(DigitalTwinNotFound {
                    id: relationship.target_id.clone(),
                })
                .change_context(InsertionError)
            })?;

        let source_model = twin_types::DigitalTwin::new(source)
            .model_id()
            .ok_or_else(|| {
                Report::new(ValidationFailed {
                    problems: vec![format!("twin `{source_id}` has no model reference")],
                })
                .change_context(InsertionError)
            })?;
        self.validate_relationship(
            &source_model,
            &relationship.name,
            &relationship.target_id,
            &relationship.properties,
        )
        .await
        .change_context(InsertionError)?;

        let existing = self
            .fetch_relationship_props(source_id, relationship_id)
            .await
            .change_context(InsertionError)?;
        if existing.is_some() && if_none_match == Some("*") {
            return Err(Report::new(PreconditionFailed).change_context(InsertionError));
        }

        let sequence = existing
            .as_ref()
            .and_then(|props| props.get(SEQUENCE))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0)
            + 1;
        let key = format!("{source_id}|{relationship_id}");
        let etag = Etag::from_write_sequence(&key, sequence);

        let mut props = relationship.clone().into_value();
        props["$etag"] = json!(etag.as_str());
        props[SEQUENCE] = json!(sequence);

        let cypher = if existing.is_some() {
            "MATCH (s:Twin)-[r]->(:Twin) \
             WHERE s['$dtId'] = $source AND r['$relationshipId'] = $id SET r = $props"
                .to_owned()
        } else {
            format!(
                "MATCH (s:Twin), (t:Twin) WHERE s['$dtId'] = $source AND t['$dtId'] = $target \
                 CREATE (s)-[r:{name}]->(t) SET r = $props",
                name = relationship.name
            )
        };
        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            &cypher,
            &age::params([
                ("source", json!(source_id)),
                ("target", json!(relationship.target_id)),
                ("id", json!(relationship_id)),
                ("props", props),
            ]),
        )
        .await
        .change_context(InsertionError)?;

        let mut stored = relationship;
        stored.etag = Some(etag);
        Ok(stored)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn get_relationship(
        &self,
        source_id: &str,
        relationship_id: &str,
    ) -> Result<BasicRelationship, Report<QueryError>> {
        let props = self
            .fetch_relationship_props(source_id, relationship_id)
            .await?
            .ok_or_else(|| {
                Report::new(RelationshipNotFound {
                    source_id: source_id.to_owned(),
                    id: relationship_id.to_owned(),
                })
                .change_context(QueryError)
            })?;
        relationship_from_props(props).change_context(QueryError)
    }

    #[tracing::instrument(level = "info", skip(self, patch))]
    async fn update_relationship(
        &mut self,
        source_id: &str,
        relationship_id: &str,
        patch: &json_patch::Patch,
        if_match: Option<&str>,
    ) -> Result<BasicRelationship, Report<UpdateError>> {
        let props = self
            .fetch_relationship_props(source_id, relationship_id)
            .await
            .change_context(UpdateError)?
            .ok_or_else(|| {
                Report::new(RelationshipNotFound {
                    source_id: source_id.to_owned(),
                    id: relationship_id.to_owned(),
                })
                .change_context(UpdateError)
            })?;

        let sequence = props.get(SEQUENCE).and_then(JsonValue::as_u64).unwrap_or(0);
        let current = relationship_from_props(props).change_context(UpdateError)?;
        if let Some(if_match) = if_match {
            let matches = current
                .etag
                .as_ref()
                .is_some_and(|etag| etag.matches(if_match));
            if !matches {
                return Err(Report::new(PreconditionFailed).change_context(UpdateError));
            }
        }

        let mut document = current.clone().into_value();
        apply_patch(&mut document, patch).change_context(UpdateError)?;
        // system keys are not patchable
        document["$relationshipId"] = json!(relationship_id);
        document["$sourceId"] = json!(source_id);
        document["$targetId"] = json!(current.target_id);
        document["$relationshipName"] = json!(current.name);

        let mut updated = BasicRelationship::from_value(&document).map_err(|reason| {
            Report::new(ArgumentError::new(reason)).change_context(UpdateError)
        })?;

        let source = self
            .fetch_twin_props(source_id)
            .await
            .change_context(UpdateError)?
            .ok_or_else(|| {
                Report::new(DigitalTwinNotFound { id: source_id.to_owned() })
                    .change_context(UpdateError)
            })?;
        let source_model = twin_types::DigitalTwin::new(source)
            .model_id()
            .ok_or_else(|| {
                Report::new(ValidationFailed {
                    problems: vec![format!("twin `{source_id}` has no model reference")],
                })
                .change_context(UpdateError)
            })?;
        self.validate_relationship(
            &source_model,
            &updated.name,
            &updated.target_id,
            &updated.properties,
        )
        .await
        .change_context(UpdateError)?;

        let next_sequence = sequence + 1;
        let key = format!("{source_id}|{relationship_id}");
        let etag = Etag::from_write_sequence(&key, next_sequence);
        updated.etag = Some(etag);

        let mut props = updated.clone().into_value();
        props[SEQUENCE] = json!(next_sequence);
        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            "MATCH (s:Twin)-[r]->(:Twin) \
             WHERE s['$dtId'] = $source AND r['$relationshipId'] = $id SET r = $props",
            &age::params([
                ("source", json!(source_id)),
                ("id", json!(relationship_id)),
                ("props", props),
            ]),
        )
        .await
        .change_context(UpdateError)?;
        Ok(updated)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_relationship(
        &mut self,
        source_id: &str,
        relationship_id: &str,
        if_match: Option<&str>,
    ) -> Result<(), Report<DeletionError>> {
        let props = self
            .fetch_relationship_props(source_id, relationship_id)
            .await
            .change_context(DeletionError)?
            .ok_or_else(|| {
                Report::new(RelationshipNotFound {
                    source_id: source_id.to_owned(),
                    id: relationship_id.to_owned(),
                })
                .change_context(DeletionError)
            })?;
        if let Some(if_match) = if_match {
            let matches = props
                .get("$etag")
                .and_then(JsonValue::as_str)
                .is_some_and(|etag| Etag::from_stored(etag).matches(if_match));
            if !matches {
                return Err(Report::new(PreconditionFailed).change_context(DeletionError));
            }
        }

        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            "MATCH (s:Twin)-[r]->(:Twin) \
             WHERE s['$dtId'] = $source AND r['$relationshipId'] = $id DELETE r",
            &age::params([("source", json!(source_id)), ("id", json!(relationship_id))]),
        )
        .await
        .change_context(DeletionError)?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn list_relationships(
        &self,
        source_id: &str,
        relationship_name: Option<&str>,
    ) -> Result<Vec<BasicRelationship>, Report<QueryError>> {
        let cypher = if relationship_name.is_some() {
            "MATCH (s:Twin)-[r]->(:Twin) \
             WHERE s['$dtId'] = $source AND r['$relationshipName'] = $name RETURN r"
        } else {
            "MATCH (s:Twin)-[r]->(:Twin) WHERE s['$dtId'] = $source RETURN r"
        };
        let rows = age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            cypher,
            &age::params([
                ("source", json!(source_id)),
                ("name", json!(relationship_name)),
            ]),
        )
        .await?;
        collect_relationships(rows)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn list_incoming_relationships(
        &self,
        target_id: &str,
    ) -> Result<Vec<BasicRelationship>, Report<QueryError>> {
        let rows = age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            "MATCH (:Twin)-[r]->(t:Twin) WHERE t['$dtId'] = $target RETURN r",
            &age::params([("target", json!(target_id))]),
        )
        .await?;
        collect_relationships(rows)
    }

    #[tracing::instrument(level = "info", skip(self, batch))]
    async fn create_or_replace_relationships(
        &mut self,
        batch: Vec<JsonValue>,
    ) -> Result<BatchOperationResult, Report<InsertionError>> {
        if batch.is_empty() {
            return Err(Report::new(ArgumentError::new(
                "a relationship batch must not be empty",
            ))
            .change_context(InsertionError));
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(Report::new(ArgumentError::new(format!(
                "the batch contains {} relationships; the maximum is {MAX_BATCH_SIZE}",
                batch.len()
            )))
            .change_context(InsertionError));
        }

        let mut result = BatchOperationResult::default();
        for (index, element) in batch.into_iter().enumerate() {
            let source_id = element
                .get("$sourceId")
                .and_then(JsonValue::as_str)
                .map(str::to_owned);
            let relationship_id = element
                .get("$relationshipId")
                .and_then(JsonValue::as_str)
                .map(str::to_owned);
            let (Some(source_id), Some(relationship_id)) = (source_id, relationship_id) else {
                result.failures.push(BatchFailure {
                    index,
                    id: None,
                    error: "`$sourceId` and `$relationshipId` are required on every batch element"
                        .to_owned(),
                });
                continue;
            };
            match self
                .create_or_replace_relationship(&source_id, &relationship_id, element, None)
                .await
            {
                Ok(relationship) => result.successes.push(relationship.into_value()),
                Err(report) => result.failures.push(BatchFailure {
                    index,
                    id: Some(relationship_id),
                    error: report.to_string(),
                }),
            }
        }
        Ok(result)
    }
}

fn collect_relationships(
    rows: Vec<age::AgRow>,
) -> Result<Vec<BasicRelationship>, Report<QueryError>> {
    rows.into_iter()
        .filter_map(|mut row| row.remove("r").and_then(age::graph_element_properties))
        .map(|props| relationship_from_props(props).change_context(QueryError))
        .collect()
}

/// Materializes the wire shape from stored edge properties, dropping the
/// internal write sequence.
fn relationship_from_props(
    mut props: JsonMap<String, JsonValue>,
) -> Result<BasicRelationship, Report<ArgumentError>> {
    props.remove(SEQUENCE);
    BasicRelationship::from_value(&JsonValue::Object(props))
        .map_err(|reason| Report::new(ArgumentError::new(reason)))
}

#[cfg(test)]
mod tests {
    use super::is_valid_relationship_name;

    #[test]
    fn relationship_names_must_be_identifiers() {
        assert!(is_valid_relationship_name("contains"));
        assert!(is_valid_relationship_name("feeds_into2"));
        assert!(!is_valid_relationship_name(""));
        assert!(!is_valid_relationship_name("9lives"));
        assert!(!is_valid_relationship_name("has space"));
        assert!(!is_valid_relationship_name("a-b"));
    }
}
