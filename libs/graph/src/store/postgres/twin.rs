//! The twin data plane: full-object upserts, JSON-Patch updates, component
//! access, and guarded deletes.

use std::{collections::BTreeMap, sync::Arc};

use error_stack::{Report, ResultExt as _};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use time::OffsetDateTime;
use twin_types::{DigitalTwin, Etag, MAX_BATCH_SIZE, model::FlattenedModel, twin};

use super::{AsClient, PostgresStore, age};
use crate::{
    cache::ResolvedModel,
    store::{
        BatchFailure, BatchOperationResult, TwinStore,
        error::{
            ArgumentError, ComponentNotFound, DeletionError, DigitalTwinNotFound,
            InsertionError, PreconditionFailed, QueryError, UpdateError, ValidationFailed,
        },
    },
};

/// The server-owned write-sequence key inside `$metadata`.
const SEQUENCE: &str = "$sequence";

impl<C: AsClient> PostgresStore<C> {
    pub(crate) async fn fetch_twin_props(
        &self,
        id: &str,
    ) -> Result<Option<JsonMap<String, JsonValue>>, Report<QueryError>> {
        let row = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (t:Twin) WHERE t['$dtId'] = $id RETURN t",
            &age::params([("id", json!(id))]),
        )
        .await?;
        Ok(row.and_then(age::graph_element_properties))
    }

    async fn count_twin_relationships(&self, id: &str) -> Result<u64, Report<QueryError>> {
        let count = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (t:Twin)-[r]-() WHERE t['$dtId'] = $id RETURN COUNT(r)",
            &age::params([("id", json!(id))]),
        )
        .await?;
        Ok(count.and_then(|value| value.as_u64()).unwrap_or(0))
    }

    /// Resolves the twin's model and the flattened models of every component
    /// the model declares, then validates the body.
    pub(crate) async fn validate_twin_body(
        &self,
        body: &DigitalTwin,
    ) -> Result<Arc<ResolvedModel>, Report<ValidationFailed>> {
        let model_id = body.model_id().ok_or_else(|| {
            Report::new(ValidationFailed {
                problems: vec!["`$metadata.$model` must reference a valid DTMI".to_owned()],
            })
        })?;
        let resolved = self
            .resolve_model(&model_id)
            .await
            .change_context_lazy(|| ValidationFailed {
                problems: vec![format!("model `{model_id}` could not be resolved")],
            })?
            .ok_or_else(|| {
                Report::new(ValidationFailed {
                    problems: vec![format!("model `{model_id}` does not exist")],
                })
            })?;
        if resolved.record.decommissioned {
            return Err(Report::new(ValidationFailed {
                problems: vec![format!("model `{model_id}` is decommissioned")],
            }));
        }

        let component_models = self.resolve_component_models(&resolved.flattened).await?;
        twin_validation::validate_twin(body, &resolved.flattened, &component_models)?;
        Ok(resolved)
    }

    async fn resolve_component_models(
        &self,
        flattened: &FlattenedModel,
    ) -> Result<BTreeMap<String, FlattenedModel>, Report<ValidationFailed>> {
        let mut component_models = BTreeMap::new();
        for (name, component) in &flattened.components {
            let resolved = self
                .resolve_model(&component.schema)
                .await
                .change_context_lazy(|| ValidationFailed {
                    problems: vec![format!(
                        "component schema `{}` could not be resolved",
                        component.schema
                    )],
                })?;
            if let Some(resolved) = resolved {
                component_models.insert(name.clone(), resolved.flattened.clone());
            }
        }
        Ok(component_models)
    }

    /// Writes the prepared body, choosing `CREATE` or `SET` by existence.
    async fn write_twin(
        &self,
        id: &str,
        body: &DigitalTwin,
        exists: bool,
    ) -> Result<(), Report<QueryError>> {
        let cypher = if exists {
            "MATCH (t:Twin) WHERE t['$dtId'] = $id SET t = $twin"
        } else {
            "CREATE (t:Twin) SET t = $twin"
        };
        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            cypher,
            &age::params([
                ("id", json!(id)),
                ("twin", body.clone().into_value()),
            ]),
        )
        .await?;
        Ok(())
    }

    /// Removes the twin together with its edges. Only the bulk-delete job's
    /// Twins phase uses this; the public path refuses while edges exist.
    pub(crate) async fn delete_twins_batch(
        &mut self,
        limit: usize,
    ) -> Result<u64, Report<DeletionError>> {
        let before = self.count_twins().await.change_context(DeletionError)?;
        let cypher = format!("MATCH (t:Twin) WITH t LIMIT {limit} DETACH DELETE t");
        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            &cypher,
            &JsonMap::new(),
        )
        .await
        .change_context(DeletionError)?;
        let after = self.count_twins().await.change_context(DeletionError)?;
        Ok(before.saturating_sub(after))
    }

    pub(crate) async fn count_twins(&self) -> Result<u64, Report<QueryError>> {
        let count = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (t:Twin) RETURN COUNT(t)",
            &JsonMap::new(),
        )
        .await?;
        Ok(count.and_then(|value| value.as_u64()).unwrap_or(0))
    }
}

impl<C: AsClient> TwinStore for PostgresStore<C> {
    #[tracing::instrument(level = "info", skip(self, body))]
    async fn create_or_replace_twin(
        &mut self,
        id: &str,
        body: JsonValue,
        if_none_match: Option<&str>,
    ) -> Result<DigitalTwin, Report<InsertionError>> {
        let mut body = DigitalTwin::from_value(body).map_err(|_| {
            Report::new(ArgumentError::new("a digital twin must be a JSON object"))
                .change_context(InsertionError)
        })?;
        if body.model_id().is_none() {
            return Err(Report::new(ArgumentError::new(
                "`$metadata.$model` is required on a digital twin",
            ))
            .change_context(InsertionError));
        }
        body.set_dt_id(id);

        self.validate_twin_body(&body)
            .await
            .change_context(InsertionError)?;

        let existing = self
            .fetch_twin_props(id)
            .await
            .change_context(InsertionError)?;
        if existing.is_some() && if_none_match == Some("*") {
            return Err(Report::new(PreconditionFailed).change_context(InsertionError));
        }

        let sequence = next_sequence(existing.as_ref());
        let now = OffsetDateTime::now_utc();
        prepare_for_write(&mut body, id, sequence, now);

        self.write_twin(id, &body, existing.is_some())
            .await
            .change_context(InsertionError)?;
        Ok(body)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn get_twin(&self, id: &str) -> Result<DigitalTwin, Report<QueryError>> {
        self.fetch_twin_props(id)
            .await?
            .map(DigitalTwin::new)
            .ok_or_else(|| {
                Report::new(DigitalTwinNotFound { id: id.to_owned() }).change_context(QueryError)
            })
    }

    #[tracing::instrument(level = "info", skip(self, patch))]
    async fn update_twin(
        &mut self,
        id: &str,
        patch: &json_patch::Patch,
        if_match: Option<&str>,
    ) -> Result<DigitalTwin, Report<UpdateError>> {
        let props = self
            .fetch_twin_props(id)
            .await
            .change_context(UpdateError)?
            .ok_or_else(|| {
                Report::new(DigitalTwinNotFound { id: id.to_owned() })
                    .change_context(UpdateError)
            })?;
        let current = DigitalTwin::new(props);
        check_etag(&current, if_match).change_context(UpdateError)?;

        let mut document = current.clone().into_value();
        apply_patch(&mut document, patch).change_context(UpdateError)?;
        let mut updated = DigitalTwin::from_value(document).map_err(|_| {
            Report::new(ArgumentError::new("the patch must leave the twin a JSON object"))
                .change_context(UpdateError)
        })?;
        updated.set_dt_id(id);

        self.validate_twin_body(&updated)
            .await
            .change_context(UpdateError)?;

        let now = OffsetDateTime::now_utc();
        let sequence = next_sequence(Some(current.as_map()));
        refresh_changed_metadata(&current, &mut updated, now);
        set_sequence(&mut updated, id, sequence);

        self.write_twin(id, &updated, true)
            .await
            .change_context(UpdateError)?;
        Ok(updated)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_twin(
        &mut self,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), Report<DeletionError>> {
        let props = self
            .fetch_twin_props(id)
            .await
            .change_context(DeletionError)?
            .ok_or_else(|| {
                Report::new(DigitalTwinNotFound { id: id.to_owned() })
                    .change_context(DeletionError)
            })?;
        check_etag(&DigitalTwin::new(props), if_match).change_context(DeletionError)?;

        let relationships = self
            .count_twin_relationships(id)
            .await
            .change_context(DeletionError)?;
        if relationships > 0 {
            return Err(Report::new(ArgumentError::new(format!(
                "digital twin `{id}` still has {relationships} relationship(s); delete them first"
            )))
            .change_context(DeletionError));
        }

        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            "MATCH (t:Twin) WHERE t['$dtId'] = $id DELETE t",
            &age::params([("id", json!(id))]),
        )
        .await
        .change_context(DeletionError)?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self, batch))]
    async fn create_or_replace_twins(
        &mut self,
        batch: Vec<JsonValue>,
    ) -> Result<BatchOperationResult, Report<InsertionError>> {
        if batch.len() > MAX_BATCH_SIZE {
            return Err(Report::new(ArgumentError::new(format!(
                "the batch contains {} twins; the maximum is {MAX_BATCH_SIZE}",
                batch.len()
            )))
            .change_context(InsertionError));
        }

        let mut result = BatchOperationResult::default();
        for (index, element) in batch.into_iter().enumerate() {
            let id = element
                .get(twin::DT_ID)
                .and_then(JsonValue::as_str)
                .map(str::to_owned);
            let Some(id) = id else {
                result.failures.push(BatchFailure {
                    index,
                    id: None,
                    error: "`$dtId` is required on every batch element".to_owned(),
                });
                continue;
            };
            match self.create_or_replace_twin(&id, element, None).await {
                Ok(twin) => result.successes.push(twin.into_value()),
                Err(report) => result.failures.push(BatchFailure {
                    index,
                    id: Some(id),
                    error: report.to_string(),
                }),
            }
        }
        Ok(result)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn get_component(
        &self,
        twin_id: &str,
        component_name: &str,
    ) -> Result<JsonValue, Report<QueryError>> {
        let twin = self.get_twin(twin_id).await?;
        self.validate_component_access(&twin, component_name)
            .await
            .change_context(QueryError)?;
        Ok(twin
            .property(component_name)
            .cloned()
            .unwrap_or_else(|| json!({ "$metadata": {} })))
    }

    #[tracing::instrument(level = "info", skip(self, patch))]
    async fn update_component(
        &mut self,
        twin_id: &str,
        component_name: &str,
        patch: &json_patch::Patch,
        if_match: Option<&str>,
    ) -> Result<JsonValue, Report<UpdateError>> {
        let props = self
            .fetch_twin_props(twin_id)
            .await
            .change_context(UpdateError)?
            .ok_or_else(|| {
                Report::new(DigitalTwinNotFound { id: twin_id.to_owned() })
                    .change_context(UpdateError)
            })?;
        let current = DigitalTwin::new(props);
        check_etag(&current, if_match).change_context(UpdateError)?;

        let component_model = self
            .validate_component_access(&current, component_name)
            .await
            .change_context(UpdateError)?;

        let mut component = current
            .property(component_name)
            .cloned()
            .unwrap_or_else(|| json!({ "$metadata": {} }));
        apply_patch(&mut component, patch).change_context(UpdateError)?;
        let component_map = component.as_object().cloned().ok_or_else(|| {
            Report::new(ArgumentError::new("the patch must leave the component an object"))
                .change_context(UpdateError)
        })?;
        twin_validation::validate_component(&component_map, &component_model)
            .change_context(UpdateError)?;

        let mut document = current.clone().into_value();
        document[component_name] = JsonValue::Object(component_map.clone());
        let mut updated = DigitalTwin::from_value(document).map_err(|_| {
            Report::new(ArgumentError::new("the patch must leave the twin a JSON object"))
                .change_context(UpdateError)
        })?;

        let now = OffsetDateTime::now_utc();
        let sequence = next_sequence(Some(current.as_map()));
        updated.touch_property_metadata(component_name, now, None);
        set_sequence(&mut updated, twin_id, sequence);

        self.write_twin(twin_id, &updated, true)
            .await
            .change_context(UpdateError)?;
        Ok(JsonValue::Object(component_map))
    }
}

impl<C: AsClient> PostgresStore<C> {
    /// Confirms `component_name` is a component on the twin's model and
    /// returns the component's flattened schema model.
    async fn validate_component_access(
        &self,
        twin: &DigitalTwin,
        component_name: &str,
    ) -> Result<FlattenedModel, Report<ComponentNotFound>> {
        let model_id = twin.model_id().ok_or_else(|| {
            Report::new(ComponentNotFound {
                name: component_name.to_owned(),
            })
        })?;
        let resolved = self
            .resolve_model(&model_id)
            .await
            .change_context_lazy(|| ComponentNotFound {
                name: component_name.to_owned(),
            })?
            .ok_or_else(|| {
                Report::new(ComponentNotFound {
                    name: component_name.to_owned(),
                })
            })?;
        let component = resolved
            .flattened
            .components
            .get(component_name)
            .ok_or_else(|| {
                Report::new(ComponentNotFound {
                    name: component_name.to_owned(),
                })
            })?;
        let component_model = self
            .resolve_model(&component.schema)
            .await
            .change_context_lazy(|| ComponentNotFound {
                name: component_name.to_owned(),
            })?
            .ok_or_else(|| {
                Report::new(ComponentNotFound {
                    name: component_name.to_owned(),
                })
            })?;
        Ok(component_model.flattened.clone())
    }
}

/// Applies an RFC 6902 patch. `remove` operations whose path is already
/// absent are dropped beforehand, so removing a missing property succeeds
/// silently.
pub(crate) fn apply_patch(
    document: &mut JsonValue,
    patch: &json_patch::Patch,
) -> Result<(), Report<ArgumentError>> {
    let effective: Vec<json_patch::PatchOperation> = patch
        .0
        .iter()
        .filter(|operation| match operation {
            json_patch::PatchOperation::Remove(remove) => {
                document.pointer(&remove.path.to_string()).is_some()
            }
            _ => true,
        })
        .cloned()
        .collect();
    json_patch::patch(document, &effective)
        .map_err(|error| Report::new(ArgumentError::new(error.to_string())))
}

pub(crate) fn check_etag(
    twin: &DigitalTwin,
    if_match: Option<&str>,
) -> Result<(), Report<PreconditionFailed>> {
    let Some(if_match) = if_match else {
        return Ok(());
    };
    match twin.etag() {
        Some(etag) if etag.matches(if_match) => Ok(()),
        _ => Err(Report::new(PreconditionFailed)),
    }
}

fn next_sequence(props: Option<&JsonMap<String, JsonValue>>) -> u64 {
    props
        .and_then(|props| props.get(twin::METADATA))
        .and_then(|metadata| metadata.get(SEQUENCE))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0)
        + 1
}

fn set_sequence(body: &mut DigitalTwin, id: &str, sequence: u64) {
    let etag = Etag::from_write_sequence(id, sequence);
    body.set_etag(&etag);
    let mut document = body.clone().into_value();
    if !document
        .get(twin::METADATA)
        .is_some_and(JsonValue::is_object)
    {
        document[twin::METADATA] = json!({});
    }
    document[twin::METADATA][SEQUENCE] = json!(sequence);
    if let Ok(twin) = DigitalTwin::from_value(document) {
        *body = twin;
    }
}

/// Rebuilds per-property metadata for a full replace: every property present
/// gets a fresh `lastUpdatedOn`, caller-supplied `sourceTime` survives, and
/// metadata of absent properties is dropped.
fn prepare_for_write(body: &mut DigitalTwin, id: &str, sequence: u64, now: OffsetDateTime) {
    let property_names: Vec<String> = body
        .properties()
        .map(|(name, _)| name.to_owned())
        .collect();
    let stale: Vec<String> = body
        .as_map()
        .get(twin::METADATA)
        .and_then(JsonValue::as_object)
        .map(|metadata| {
            metadata
                .keys()
                .filter(|key| !key.starts_with('$') && !property_names.contains(key))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    for name in stale {
        body.remove_property_metadata(&name);
    }
    for name in &property_names {
        body.touch_property_metadata(name, now, None);
    }
    set_sequence(body, id, sequence);
}

/// After a patch, only properties whose value actually changed get fresh
/// `lastUpdatedOn`; removed properties lose their metadata entry.
fn refresh_changed_metadata(current: &DigitalTwin, updated: &mut DigitalTwin, now: OffsetDateTime) {
    let changed: Vec<String> = updated
        .properties()
        .filter(|(name, value)| current.property(name) != Some(*value))
        .map(|(name, _)| name.to_owned())
        .collect();
    let removed: Vec<String> = current
        .properties()
        .filter(|(name, _)| updated.property(name).is_none())
        .map(|(name, _)| name.to_owned())
        .collect();
    for name in changed {
        updated.touch_property_metadata(&name, now, None);
    }
    for name in removed {
        updated.remove_property_metadata(&name);
    }
}
