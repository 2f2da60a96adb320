//! The model catalog: DTDL ingestion, the persisted inheritance index, and
//! the guarded update/replace/delete paths.
//!
//! Models are `Model`-labeled vertices whose properties carry the raw DTDL
//! document next to the derived `bases`/`descendants` arrays. Direct
//! `extends` parents and component schemas additionally materialize as
//! `_extends`/`_hasComponent` edges so referential guards stay cheap.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use error_stack::{Report, ResultExt as _};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use twin_types::{
    Dtmi, ModelRecord,
    model::{DtdlContent, DtdlInterface, flatten_contents, flatten_raw_contents},
};

use super::{AsClient, PostgresStore, age};
use crate::{
    cache::ResolvedModel,
    store::{
        GetModelOptions, ListModelsOptions, ModelStore,
        error::{
            ArgumentError, DeletionError, InsertionError, ModelAlreadyExists,
            ModelExtendsChanged, ModelNotFound, ModelReferencesNotDeleted,
            ModelUpdateValidationError, QueryError, StoreError, UpdateError,
        },
    },
};

impl<C: AsClient> PostgresStore<C> {
    pub(crate) async fn fetch_model_props(
        &self,
        id: &Dtmi,
    ) -> Result<Option<JsonMap<String, JsonValue>>, Report<QueryError>> {
        let row = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (m:Model) WHERE m.id = $id RETURN m",
            &age::params([("id", json!(id.as_str()))]),
        )
        .await?;
        Ok(row.and_then(age::graph_element_properties))
    }

    async fn fetch_many_model_props(
        &self,
        ids: &BTreeSet<Dtmi>,
    ) -> Result<BTreeMap<Dtmi, JsonMap<String, JsonValue>>, Report<QueryError>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let id_list: Vec<_> = ids.iter().map(|id| json!(id.as_str())).collect();
        let rows = age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            "MATCH (m:Model) WHERE m.id IN $ids RETURN m",
            &age::params([("ids", JsonValue::Array(id_list))]),
        )
        .await?;

        let mut nodes = BTreeMap::new();
        for mut row in rows {
            let Some(props) = row
                .remove("m")
                .and_then(age::graph_element_properties)
            else {
                continue;
            };
            if let Some(id) = props
                .get("id")
                .and_then(JsonValue::as_str)
                .and_then(|id| id.parse::<Dtmi>().ok())
            {
                nodes.insert(id, props);
            }
        }
        Ok(nodes)
    }

    /// Resolves a model through the read-through cache: stored record,
    /// parsed interface, and contents flattened over all bases.
    pub(crate) async fn resolve_model(
        &self,
        id: &Dtmi,
    ) -> Result<Option<Arc<ResolvedModel>>, Report<QueryError>> {
        if let Some(model) = self.model_cache().get(id) {
            return Ok(Some(model));
        }
        let Some(props) = self.fetch_model_props(id).await? else {
            return Ok(None);
        };
        let record = record_from_props(&props, true)?;
        let interface = interface_from_record(&record)?;

        let base_props = self
            .fetch_many_model_props(&record.bases.iter().cloned().collect())
            .await?;
        let mut base_interfaces = Vec::with_capacity(record.bases.len());
        for base in &record.bases {
            if let Some(props) = base_props.get(base) {
                let base_record = record_from_props(props, true)?;
                base_interfaces.push(interface_from_record(&base_record)?);
            }
        }
        let flattened = flatten_contents(&interface, base_interfaces.iter());

        let resolved = ResolvedModel {
            record,
            interface,
            flattened,
        };
        self.model_cache().insert(resolved.clone());
        Ok(Some(Arc::new(resolved)))
    }

    /// Deletes up to `limit` models, children before parents, detaching
    /// their edges. Used by the bulk-delete job's Models phase.
    pub(crate) async fn delete_models_batch(
        &mut self,
        limit: usize,
    ) -> Result<u64, Report<DeletionError>> {
        let rows = age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            "MATCH (m:Model) RETURN m.id AS id, m.bases AS bases",
            &JsonMap::new(),
        )
        .await
        .change_context(DeletionError)?;

        let mut models: Vec<(String, usize)> = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get("id")?.as_str()?.to_owned();
                let depth = row
                    .get("bases")
                    .and_then(JsonValue::as_array)
                    .map_or(0, Vec::len);
                Some((id, depth))
            })
            .collect();
        // children carry strictly more bases than any of their parents, so
        // deepest-first is leaves-first over `_extends`
        models.sort_by(|left, right| right.1.cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
        models.truncate(limit);

        if models.is_empty() {
            return Ok(0);
        }
        let ids: Vec<_> = models.iter().map(|(id, _)| json!(id)).collect();
        let count = models.len() as u64;
        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            "MATCH (m:Model) WHERE m.id IN $ids DETACH DELETE m",
            &age::params([("ids", JsonValue::Array(ids))]),
        )
        .await
        .change_context(DeletionError)?;
        self.model_cache().clear();
        Ok(count)
    }

    async fn count_twins_of_model(&self, id: &Dtmi) -> Result<u64, Report<QueryError>> {
        let count = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (t:Twin) WHERE t['$metadata']['$model'] = $id RETURN COUNT(t)",
            &age::params([("id", json!(id.as_str()))]),
        )
        .await?;
        Ok(count.and_then(|value| value.as_u64()).unwrap_or(0))
    }

    async fn count_component_references(&self, id: &Dtmi) -> Result<u64, Report<QueryError>> {
        let count = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (m:Model)-[:_hasComponent]->(target:Model) WHERE target.id = $id \
             RETURN COUNT(m)",
            &age::params([("id", json!(id.as_str()))]),
        )
        .await?;
        Ok(count.and_then(|value| value.as_u64()).unwrap_or(0))
    }

    async fn count_target_references(&self, id: &Dtmi) -> Result<u64, Report<QueryError>> {
        let count = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (m:Model) WHERE $id IN m.refs AND NOT (m.id = $id) RETURN COUNT(m)",
            &age::params([("id", json!(id.as_str()))]),
        )
        .await?;
        Ok(count.and_then(|value| value.as_u64()).unwrap_or(0))
    }
}

impl<C: AsClient> ModelStore for PostgresStore<C> {
    #[tracing::instrument(level = "info", skip(self, documents))]
    async fn create_models(
        &mut self,
        documents: &[JsonValue],
    ) -> Result<Vec<ModelRecord>, Report<InsertionError>> {
        if documents.is_empty() {
            return Err(Report::new(ArgumentError::new("at least one model is required"))
                .change_context(InsertionError));
        }

        // parse the batch and reject in-batch duplicates
        let mut batch: BTreeMap<Dtmi, DtdlInterface> = BTreeMap::new();
        let mut batch_order = Vec::with_capacity(documents.len());
        let mut raw_documents: BTreeMap<Dtmi, JsonValue> = BTreeMap::new();
        for (index, document) in documents.iter().enumerate() {
            let interface = DtdlInterface::from_document(document, index)
                .map_err(|error| {
                    Report::new(ArgumentError::new(error.to_string()))
                        .change_context(InsertionError)
                })?;
            let id = interface.id.clone();
            if batch.insert(id.clone(), interface).is_some() {
                return Err(Report::new(ArgumentError::new(format!(
                    "model `{id}` appears more than once in the batch"
                )))
                .change_context(InsertionError));
            }
            raw_documents.insert(id.clone(), document.clone());
            batch_order.push(id);
        }

        // resolve the reference closure: in-batch first, then the store
        let mut resolved: BTreeMap<Dtmi, DtdlInterface> = batch.clone();
        let mut pending: BTreeSet<Dtmi> = batch
            .values()
            .flat_map(DtdlInterface::referenced_dtmis)
            .filter(|id| !resolved.contains_key(id))
            .collect();
        let mut persisted_props: BTreeMap<Dtmi, JsonMap<String, JsonValue>> = BTreeMap::new();
        let mut unresolved = BTreeSet::new();
        while !pending.is_empty() {
            let fetched = self
                .fetch_many_model_props(&pending)
                .await
                .change_context(InsertionError)?;
            let mut next = BTreeSet::new();
            for id in pending {
                let Some(props) = fetched.get(&id) else {
                    unresolved.insert(id);
                    continue;
                };
                let record = record_from_props(props, true).change_context(InsertionError)?;
                let interface = interface_from_record(&record).change_context(InsertionError)?;
                next.extend(
                    interface
                        .referenced_dtmis()
                        .into_iter()
                        .filter(|reference| {
                            !resolved.contains_key(reference) && !unresolved.contains(reference)
                        }),
                );
                resolved.insert(id.clone(), interface);
                persisted_props.insert(id.clone(), props.clone());
            }
            pending = next;
        }
        if !unresolved.is_empty() {
            return Err(Report::new(crate::store::error::ResolutionError {
                unresolved: unresolved.into_iter().map(|id| id.to_string()).collect(),
            })
            .change_context(InsertionError));
        }

        // a live model with the same DTMI is a conflict; a decommissioned
        // one is replaced by the upsert below
        let existing = self
            .fetch_many_model_props(&batch.keys().cloned().collect())
            .await
            .change_context(InsertionError)?;
        for (id, props) in &existing {
            if !props
                .get("decommissioned")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false)
            {
                return Err(Report::new(ModelAlreadyExists { id: id.to_string() })
                    .change_context(InsertionError));
            }
        }

        // derive the inheritance index for every new model
        let mut bases_by_id: BTreeMap<Dtmi, Vec<Dtmi>> = BTreeMap::new();
        for id in &batch_order {
            let bases = twin_types::compute_bases(id, &resolved).map_err(|missing| {
                Report::new(crate::store::error::ResolutionError {
                    unresolved: missing.into_iter().map(|id| id.to_string()).collect(),
                })
                .change_context(InsertionError)
            })?;
            bases_by_id.insert(id.clone(), bases);
        }

        // new descendants per base, in batch order
        let mut new_descendants: BTreeMap<Dtmi, Vec<Dtmi>> = BTreeMap::new();
        for id in &batch_order {
            for base in &bases_by_id[id] {
                new_descendants.entry(base.clone()).or_default().push(id.clone());
            }
        }

        let now = OffsetDateTime::now_utc();
        let transaction = self.transaction().await.change_context(InsertionError)?;

        for id in &batch_order {
            let interface = &batch[id];
            let mut props = model_props(
                id,
                &raw_documents[id],
                &bases_by_id[id],
                interface,
                now,
            );
            let cypher = if let Some(previous) = existing.get(id) {
                // a decommissioned model keeps its descendants; its stale
                // outgoing edges are dropped before being re-created below
                props.insert(
                    "descendants".to_owned(),
                    previous
                        .get("descendants")
                        .cloned()
                        .unwrap_or_else(|| JsonValue::Array(Vec::new())),
                );
                age::execute_cypher(
                    transaction.client.as_client(),
                    transaction.graph(),
                    "MATCH (m:Model)-[edge]->(:Model) WHERE m.id = $id DELETE edge",
                    &age::params([("id", json!(id.as_str()))]),
                )
                .await
                .change_context(InsertionError)?;
                "MATCH (m:Model) WHERE m.id = $id SET m = $props"
            } else {
                "CREATE (m:Model) SET m = $props"
            };
            age::execute_cypher(
                transaction.client.as_client(),
                transaction.graph(),
                cypher,
                &age::params([("id", json!(id.as_str())), ("props", JsonValue::Object(props))]),
            )
            .await
            .change_context(InsertionError)?;
        }

        for id in &batch_order {
            let interface = &batch[id];
            for parent in &interface.extends {
                transaction
                    .create_model_edge(id, parent, "_extends")
                    .await
                    .change_context(InsertionError)?;
            }
            for content in &interface.contents {
                if let DtdlContent::Component(component) = content {
                    transaction
                        .create_model_edge(id, &component.schema, "_hasComponent")
                        .await
                        .change_context(InsertionError)?;
                }
            }
        }

        for (base, additions) in &new_descendants {
            let mut descendants: Vec<Dtmi> = persisted_props
                .get(base)
                .map(|props| descendants_from_props(props))
                .unwrap_or_default();
            for addition in additions {
                if !descendants.contains(addition) {
                    descendants.push(addition.clone());
                }
            }
            let descendant_list: Vec<_> =
                descendants.iter().map(|id| json!(id.as_str())).collect();
            age::execute_cypher(
                transaction.client.as_client(),
                transaction.graph(),
                "MATCH (m:Model) WHERE m.id = $id SET m.descendants = $descendants",
                &age::params([
                    ("id", json!(base.as_str())),
                    ("descendants", JsonValue::Array(descendant_list)),
                ]),
            )
            .await
            .change_context(InsertionError)?;
        }

        // read the final state back so records reflect in-batch descendants
        let final_props = transaction
            .fetch_many_model_props(&batch.keys().cloned().collect())
            .await
            .change_context(InsertionError)?;
        transaction.commit().await.change_context(InsertionError)?;

        for id in batch.keys() {
            self.model_cache().invalidate(id);
        }

        batch_order
            .iter()
            .map(|id| {
                final_props
                    .get(id)
                    .ok_or_else(|| {
                        Report::new(StoreError)
                            .attach_printable(format!("model `{id}` vanished mid-transaction"))
                            .change_context(InsertionError)
                    })
                    .and_then(|props| {
                        record_from_props(props, true).change_context(InsertionError)
                    })
            })
            .collect()
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn get_model(
        &self,
        id: &Dtmi,
        options: GetModelOptions,
    ) -> Result<ModelRecord, Report<QueryError>> {
        let props = self.fetch_model_props(id).await?.ok_or_else(|| {
            Report::new(ModelNotFound { id: id.to_string() }).change_context(QueryError)
        })?;
        let mut record = record_from_props(&props, true)?;

        if options.include_base_model_contents {
            let base_props = self
                .fetch_many_model_props(&record.bases.iter().cloned().collect())
                .await?;
            let mut chain: Vec<&JsonValue> = Vec::with_capacity(record.bases.len() + 1);
            // `bases` is nearest-first; the merge wants farthest-first
            for base in record.bases.iter().rev() {
                if let Some(props) = base_props.get(base) {
                    if let Some(document) = props.get("model") {
                        chain.push(document);
                    }
                }
            }
            let own_document = record.model.clone().unwrap_or(JsonValue::Null);
            let mut documents = chain;
            documents.push(&own_document);
            record.contents = Some(flatten_raw_contents(documents));
        }
        Ok(record)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn list_models(
        &self,
        options: ListModelsOptions,
    ) -> Result<Vec<ModelRecord>, Report<QueryError>> {
        let props = if options.dependencies_for.is_empty() {
            let rows = age::execute_cypher(
                self.client.as_client(),
                self.graph(),
                "MATCH (m:Model) RETURN m",
                &JsonMap::new(),
            )
            .await?;
            rows.into_iter()
                .filter_map(|mut row| row.remove("m").and_then(age::graph_element_properties))
                .collect::<Vec<_>>()
        } else {
            let roots: BTreeSet<Dtmi> = options.dependencies_for.iter().cloned().collect();
            let root_props = self.fetch_many_model_props(&roots).await?;
            let mut wanted: BTreeSet<Dtmi> = roots.clone();
            for props in root_props.values() {
                wanted.extend(bases_from_props(props));
            }
            self.fetch_many_model_props(&wanted)
                .await?
                .into_values()
                .collect()
        };

        props
            .iter()
            .map(|props| record_from_props(props, options.include_model_definition))
            .collect()
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn update_model(
        &mut self,
        id: &Dtmi,
        decommissioned: bool,
    ) -> Result<(), Report<UpdateError>> {
        let updated = age::execute_cypher_scalar(
            self.client.as_client(),
            self.graph(),
            "MATCH (m:Model) WHERE m.id = $id SET m.decommissioned = $decommissioned RETURN m.id",
            &age::params([
                ("id", json!(id.as_str())),
                ("decommissioned", json!(decommissioned)),
            ]),
        )
        .await
        .change_context(UpdateError)?;
        if updated.is_none() {
            return Err(
                Report::new(ModelNotFound { id: id.to_string() }).change_context(UpdateError)
            );
        }
        self.model_cache().invalidate(id);
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self, document))]
    async fn replace_model(
        &mut self,
        id: &Dtmi,
        document: &JsonValue,
    ) -> Result<ModelRecord, Report<UpdateError>> {
        let interface = DtdlInterface::from_document(document, 0).map_err(|error| {
            Report::new(ArgumentError::new(error.to_string())).change_context(UpdateError)
        })?;
        if interface.id != *id {
            return Err(Report::new(ArgumentError::new(format!(
                "`@id` `{}` does not match the model being replaced (`{id}`)",
                interface.id
            )))
            .change_context(UpdateError));
        }

        let props = self
            .fetch_model_props(id)
            .await
            .change_context(UpdateError)?
            .ok_or_else(|| {
                Report::new(ModelNotFound { id: id.to_string() }).change_context(UpdateError)
            })?;
        let record = record_from_props(&props, true).change_context(UpdateError)?;
        let old_interface = interface_from_record(&record).change_context(UpdateError)?;

        let old_extends: BTreeSet<_> = old_interface.extends.iter().cloned().collect();
        let new_extends: BTreeSet<_> = interface.extends.iter().cloned().collect();
        if old_extends != new_extends {
            return Err(Report::new(ModelExtendsChanged { id: id.to_string() })
                .change_context(UpdateError));
        }

        // newly-introduced content names must not collide with contents
        // declared by any descendant
        let old_names: BTreeSet<&str> = old_interface
            .contents
            .iter()
            .map(DtdlContent::name)
            .collect();
        let added_names: BTreeSet<&str> = interface
            .contents
            .iter()
            .map(DtdlContent::name)
            .filter(|name| !old_names.contains(name))
            .collect();
        if !added_names.is_empty() {
            let descendant_props = self
                .fetch_many_model_props(&record.descendants.iter().cloned().collect())
                .await
                .change_context(UpdateError)?;
            let mut conflicts = Vec::new();
            for (descendant, props) in &descendant_props {
                let descendant_record =
                    record_from_props(props, true).change_context(UpdateError)?;
                let descendant_interface =
                    interface_from_record(&descendant_record).change_context(UpdateError)?;
                for content in &descendant_interface.contents {
                    if added_names.contains(content.name()) {
                        conflicts.push(format!("{descendant}:{}", content.name()));
                    }
                }
            }
            if !conflicts.is_empty() {
                conflicts.sort();
                return Err(Report::new(ModelUpdateValidationError {
                    id: id.to_string(),
                    conflicts,
                })
                .change_context(UpdateError));
            }
        }

        let old_components: BTreeSet<Dtmi> = component_schemas(&old_interface);
        let new_components: BTreeSet<Dtmi> = component_schemas(&interface);

        let now = OffsetDateTime::now_utc();
        let mut new_props = model_props(id, document, &record.bases, &interface, now);
        new_props.insert(
            "descendants".to_owned(),
            JsonValue::Array(
                record
                    .descendants
                    .iter()
                    .map(|descendant| json!(descendant.as_str()))
                    .collect(),
            ),
        );
        new_props.insert("decommissioned".to_owned(), json!(record.decommissioned));

        let transaction = self.transaction().await.change_context(UpdateError)?;
        age::execute_cypher(
            transaction.client.as_client(),
            transaction.graph(),
            "MATCH (m:Model) WHERE m.id = $id SET m = $props",
            &age::params([
                ("id", json!(id.as_str())),
                ("props", JsonValue::Object(new_props)),
            ]),
        )
        .await
        .change_context(UpdateError)?;

        for removed in old_components.difference(&new_components) {
            age::execute_cypher(
                transaction.client.as_client(),
                transaction.graph(),
                "MATCH (m:Model)-[edge:_hasComponent]->(target:Model) \
                 WHERE m.id = $id AND target.id = $target DELETE edge",
                &age::params([
                    ("id", json!(id.as_str())),
                    ("target", json!(removed.as_str())),
                ]),
            )
            .await
            .change_context(UpdateError)?;
        }
        for added in new_components.difference(&old_components) {
            transaction
                .create_model_edge(id, added, "_hasComponent")
                .await
                .change_context(UpdateError)?;
        }

        let final_props = transaction
            .fetch_model_props(id)
            .await
            .change_context(UpdateError)?;
        transaction.commit().await.change_context(UpdateError)?;
        self.model_cache().invalidate(id);

        final_props
            .as_ref()
            .map(|props| record_from_props(props, true).change_context(UpdateError))
            .transpose()?
            .ok_or_else(|| {
                Report::new(ModelNotFound { id: id.to_string() }).change_context(UpdateError)
            })
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_model(&mut self, id: &Dtmi) -> Result<(), Report<DeletionError>> {
        let props = self
            .fetch_model_props(id)
            .await
            .change_context(DeletionError)?
            .ok_or_else(|| {
                Report::new(ModelNotFound { id: id.to_string() }).change_context(DeletionError)
            })?;
        let record = record_from_props(&props, false).change_context(DeletionError)?;

        let extends_children = record.descendants.len() as u64;
        let component_references = self
            .count_component_references(id)
            .await
            .change_context(DeletionError)?;
        let target_references = self
            .count_target_references(id)
            .await
            .change_context(DeletionError)?;
        let twins = self
            .count_twins_of_model(id)
            .await
            .change_context(DeletionError)?;
        if extends_children + component_references + target_references + twins > 0 {
            return Err(Report::new(ModelReferencesNotDeleted { id: id.to_string() })
                .change_context(DeletionError)
                .attach_printable(format!(
                    "{extends_children} extending model(s), {component_references} component \
                     reference(s), {target_references} relationship target(s), {twins} twin(s)"
                )));
        }

        let ancestor_props = self
            .fetch_many_model_props(&record.bases.iter().cloned().collect())
            .await
            .change_context(DeletionError)?;

        let transaction = self.transaction().await.change_context(DeletionError)?;
        for (ancestor, props) in &ancestor_props {
            let remaining: Vec<_> = descendants_from_props(props)
                .into_iter()
                .filter(|descendant| descendant != id)
                .map(|descendant| json!(descendant.as_str()))
                .collect();
            age::execute_cypher(
                transaction.client.as_client(),
                transaction.graph(),
                "MATCH (m:Model) WHERE m.id = $id SET m.descendants = $descendants",
                &age::params([
                    ("id", json!(ancestor.as_str())),
                    ("descendants", JsonValue::Array(remaining)),
                ]),
            )
            .await
            .change_context(DeletionError)?;
        }
        age::execute_cypher(
            transaction.client.as_client(),
            transaction.graph(),
            "MATCH (m:Model) WHERE m.id = $id DETACH DELETE m",
            &age::params([("id", json!(id.as_str()))]),
        )
        .await
        .change_context(DeletionError)?;
        transaction.commit().await.change_context(DeletionError)?;

        self.model_cache().invalidate(id);
        for ancestor in &record.bases {
            self.model_cache().invalidate(ancestor);
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_all_models(&mut self) -> Result<u64, Report<DeletionError>> {
        let mut total = 0;
        loop {
            let deleted = self.delete_models_batch(100).await?;
            if deleted == 0 {
                break;
            }
            total += deleted;
        }
        Ok(total)
    }
}

impl<C: AsClient> PostgresStore<C> {
    async fn create_model_edge(
        &self,
        from: &Dtmi,
        to: &Dtmi,
        label: &str,
    ) -> Result<(), Report<QueryError>> {
        let cypher = format!(
            "MATCH (child:Model), (parent:Model) \
             WHERE child.id = $child AND parent.id = $parent \
             CREATE (child)-[:{label}]->(parent)"
        );
        age::execute_cypher(
            self.client.as_client(),
            self.graph(),
            &cypher,
            &age::params([
                ("child", json!(from.as_str())),
                ("parent", json!(to.as_str())),
            ]),
        )
        .await?;
        Ok(())
    }
}

/// Builds the vertex property map for a model. `descendants` starts empty
/// and `decommissioned` false; replace paths overwrite both afterwards.
fn model_props(
    id: &Dtmi,
    document: &JsonValue,
    bases: &[Dtmi],
    interface: &DtdlInterface,
    now: OffsetDateTime,
) -> JsonMap<String, JsonValue> {
    let refs: Vec<_> = interface
        .contents
        .iter()
        .filter_map(|content| match content {
            DtdlContent::Relationship(relationship) => relationship
                .target
                .as_ref()
                .map(|target| json!(target.as_str())),
            _ => None,
        })
        .collect();

    let mut props = JsonMap::new();
    props.insert("id".to_owned(), json!(id.as_str()));
    props.insert("model".to_owned(), document.clone());
    props.insert(
        "bases".to_owned(),
        JsonValue::Array(bases.iter().map(|base| json!(base.as_str())).collect()),
    );
    props.insert("descendants".to_owned(), JsonValue::Array(Vec::new()));
    props.insert("decommissioned".to_owned(), json!(false));
    props.insert(
        "uploadTime".to_owned(),
        json!(now.format(&Rfc3339).unwrap_or_default()),
    );
    props.insert("refs".to_owned(), JsonValue::Array(refs));
    props
}

fn component_schemas(interface: &DtdlInterface) -> BTreeSet<Dtmi> {
    interface
        .contents
        .iter()
        .filter_map(|content| match content {
            DtdlContent::Component(component) => Some(component.schema.clone()),
            _ => None,
        })
        .collect()
}

fn dtmi_array(props: &JsonMap<String, JsonValue>, key: &str) -> Vec<Dtmi> {
    props
        .get(key)
        .and_then(JsonValue::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str()?.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn bases_from_props(props: &JsonMap<String, JsonValue>) -> Vec<Dtmi> {
    dtmi_array(props, "bases")
}

fn descendants_from_props(props: &JsonMap<String, JsonValue>) -> Vec<Dtmi> {
    dtmi_array(props, "descendants")
}

/// Converts stored vertex properties into a [`ModelRecord`].
pub(crate) fn record_from_props(
    props: &JsonMap<String, JsonValue>,
    include_definition: bool,
) -> Result<ModelRecord, Report<QueryError>> {
    let id: Dtmi = props
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| Report::new(QueryError).attach_printable("model node is missing `id`"))?
        .parse()
        .map_err(|error| Report::new(QueryError).attach_printable(format!("{error}")))?;

    let upload_time = props
        .get("uploadTime")
        .and_then(JsonValue::as_str)
        .and_then(|text| OffsetDateTime::parse(text, &Rfc3339).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);

    Ok(ModelRecord {
        id,
        model: include_definition
            .then(|| props.get("model").cloned())
            .flatten(),
        contents: None,
        bases: bases_from_props(props),
        descendants: descendants_from_props(props),
        decommissioned: props
            .get("decommissioned")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
        upload_time,
    })
}

/// Re-parses the stored DTDL document of a record.
pub(crate) fn interface_from_record(
    record: &ModelRecord,
) -> Result<DtdlInterface, Report<QueryError>> {
    let document = record.model.as_ref().ok_or_else(|| {
        Report::new(QueryError)
            .attach_printable(format!("model `{}` has no stored document", record.id))
    })?;
    DtdlInterface::from_document(document, 0)
        .map_err(|error| Report::new(QueryError).attach_printable(error.to_string()))
}
