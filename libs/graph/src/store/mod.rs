//! Store interfaces and the Postgres/AGE implementation.
//!
//! The traits in this module are the seams between the service surface and
//! the backing store: the data plane and the job executors are written
//! against them, so the concrete [`PostgresStore`] never leaks upward.

mod config;
pub mod error;
pub(crate) mod postgres;

use core::{future::Future, time::Duration};

use error_stack::Report;
use serde::Serialize;
use serde_json::Value as JsonValue;
use twin_types::{
    BasicRelationship, DigitalTwin, Dtmi, ModelRecord,
    job::{DeleteCheckpoint, JobCounters, JobLockInfo, JobRecord, JobStatus, JobType},
};

pub use self::{
    config::{DatabaseConnectionInfo, DatabasePoolConfig},
    error::{
        ArgumentError, DeletionError, InsertionError, QueryError, StoreError, UpdateError,
    },
    postgres::{AsClient, GraphName, PooledStore, PostgresStore, PostgresStorePool},
};

/// Options for reading a single model.
#[derive(Debug, Default, Copy, Clone)]
pub struct GetModelOptions {
    /// Also return the `contents` flattened over all bases.
    pub include_base_model_contents: bool,
}

/// Options for listing models.
#[derive(Debug, Default, Clone)]
pub struct ListModelsOptions {
    /// Include the raw DTDL document on every record.
    pub include_model_definition: bool,
    /// Restrict the listing to these models and everything they depend on.
    pub dependencies_for: Vec<Dtmi>,
}

/// Outcome of a batch mutation: per-item, never all-or-nothing.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationResult {
    pub successes: Vec<JsonValue>,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    /// Zero-based position in the submitted batch.
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub error: String,
}

/// The model catalog.
pub trait ModelStore {
    /// Creates a batch of models atomically.
    fn create_models(
        &mut self,
        documents: &[JsonValue],
    ) -> impl Future<Output = Result<Vec<ModelRecord>, Report<InsertionError>>> + Send;

    fn get_model(
        &self,
        id: &Dtmi,
        options: GetModelOptions,
    ) -> impl Future<Output = Result<ModelRecord, Report<QueryError>>> + Send;

    fn list_models(
        &self,
        options: ListModelsOptions,
    ) -> impl Future<Output = Result<Vec<ModelRecord>, Report<QueryError>>> + Send;

    /// Toggles the decommissioned flag.
    fn update_model(
        &mut self,
        id: &Dtmi,
        decommissioned: bool,
    ) -> impl Future<Output = Result<(), Report<UpdateError>>> + Send;

    /// Replaces a model's document without changing its identity or its
    /// direct `extends` set.
    fn replace_model(
        &mut self,
        id: &Dtmi,
        document: &JsonValue,
    ) -> impl Future<Output = Result<ModelRecord, Report<UpdateError>>> + Send;

    fn delete_model(
        &mut self,
        id: &Dtmi,
    ) -> impl Future<Output = Result<(), Report<DeletionError>>> + Send;

    /// Deletes every model, children before parents. Returns the number of
    /// models deleted.
    fn delete_all_models(
        &mut self,
    ) -> impl Future<Output = Result<u64, Report<DeletionError>>> + Send;
}

/// Twin and component access.
pub trait TwinStore {
    fn create_or_replace_twin(
        &mut self,
        id: &str,
        body: JsonValue,
        if_none_match: Option<&str>,
    ) -> impl Future<Output = Result<DigitalTwin, Report<InsertionError>>> + Send;

    fn get_twin(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<DigitalTwin, Report<QueryError>>> + Send;

    /// Applies an RFC 6902 patch to the twin body.
    fn update_twin(
        &mut self,
        id: &str,
        patch: &json_patch::Patch,
        if_match: Option<&str>,
    ) -> impl Future<Output = Result<DigitalTwin, Report<UpdateError>>> + Send;

    fn delete_twin(
        &mut self,
        id: &str,
        if_match: Option<&str>,
    ) -> impl Future<Output = Result<(), Report<DeletionError>>> + Send;

    /// Upserts up to [`twin_types::MAX_BATCH_SIZE`] twins, each validated
    /// independently.
    fn create_or_replace_twins(
        &mut self,
        batch: Vec<JsonValue>,
    ) -> impl Future<Output = Result<BatchOperationResult, Report<InsertionError>>> + Send;

    fn get_component(
        &self,
        twin_id: &str,
        component_name: &str,
    ) -> impl Future<Output = Result<JsonValue, Report<QueryError>>> + Send;

    fn update_component(
        &mut self,
        twin_id: &str,
        component_name: &str,
        patch: &json_patch::Patch,
        if_match: Option<&str>,
    ) -> impl Future<Output = Result<JsonValue, Report<UpdateError>>> + Send;
}

/// Relationship (edge) access.
pub trait RelationshipStore {
    fn create_or_replace_relationship(
        &mut self,
        source_id: &str,
        relationship_id: &str,
        body: JsonValue,
        if_none_match: Option<&str>,
    ) -> impl Future<Output = Result<BasicRelationship, Report<InsertionError>>> + Send;

    fn get_relationship(
        &self,
        source_id: &str,
        relationship_id: &str,
    ) -> impl Future<Output = Result<BasicRelationship, Report<QueryError>>> + Send;

    fn update_relationship(
        &mut self,
        source_id: &str,
        relationship_id: &str,
        patch: &json_patch::Patch,
        if_match: Option<&str>,
    ) -> impl Future<Output = Result<BasicRelationship, Report<UpdateError>>> + Send;

    fn delete_relationship(
        &mut self,
        source_id: &str,
        relationship_id: &str,
        if_match: Option<&str>,
    ) -> impl Future<Output = Result<(), Report<DeletionError>>> + Send;

    /// Outgoing relationships, optionally filtered by name.
    fn list_relationships(
        &self,
        source_id: &str,
        relationship_name: Option<&str>,
    ) -> impl Future<Output = Result<Vec<BasicRelationship>, Report<QueryError>>> + Send;

    fn list_incoming_relationships(
        &self,
        target_id: &str,
    ) -> impl Future<Output = Result<Vec<BasicRelationship>, Report<QueryError>>> + Send;

    /// Upserts a non-empty batch of up to [`twin_types::MAX_BATCH_SIZE`]
    /// relationships.
    fn create_or_replace_relationships(
        &mut self,
        batch: Vec<JsonValue>,
    ) -> impl Future<Output = Result<BatchOperationResult, Report<InsertionError>>> + Send;
}

/// Durable job records, locks, and checkpoints.
pub trait JobStore {
    fn create_job(
        &mut self,
        id: &str,
        job_type: JobType,
        options: &JsonValue,
    ) -> impl Future<Output = Result<JobRecord, Report<InsertionError>>> + Send;

    fn get_job(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<JobRecord, Report<QueryError>>> + Send;

    fn list_jobs(
        &self,
        job_type: Option<JobType>,
    ) -> impl Future<Output = Result<Vec<JobRecord>, Report<QueryError>>> + Send;

    /// Applies a checked status transition and returns the updated record.
    fn update_job_status(
        &mut self,
        id: &str,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> impl Future<Output = Result<JobRecord, Report<UpdateError>>> + Send;

    /// Adds the given deltas onto the job's counters.
    fn add_job_counters(
        &mut self,
        id: &str,
        deltas: &JobCounters,
    ) -> impl Future<Output = Result<(), Report<UpdateError>>> + Send;

    fn delete_job(
        &mut self,
        id: &str,
    ) -> impl Future<Output = Result<(), Report<DeletionError>>> + Send;

    /// Inserts or takes over the lock row if no unexpired lock exists.
    /// Expiry is evaluated by the store's clock.
    fn try_acquire_lock(
        &mut self,
        job_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, Report<InsertionError>>> + Send;

    /// Refreshes the heartbeat; only the owner succeeds.
    fn renew_lock(
        &mut self,
        job_id: &str,
    ) -> impl Future<Output = Result<bool, Report<UpdateError>>> + Send;

    /// Releases the lock; only the owner succeeds.
    fn release_lock(
        &mut self,
        job_id: &str,
    ) -> impl Future<Output = Result<bool, Report<DeletionError>>> + Send;

    /// Removes every expired lock and returns how many were removed.
    fn cleanup_expired_locks(
        &mut self,
    ) -> impl Future<Output = Result<u64, Report<DeletionError>>> + Send;

    /// The lock row, if any; reports expiry without deleting.
    fn get_lock_info(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<JobLockInfo>, Report<QueryError>>> + Send;

    /// Idempotent checkpoint upsert.
    fn save_checkpoint(
        &mut self,
        checkpoint: &DeleteCheckpoint,
    ) -> impl Future<Output = Result<(), Report<UpdateError>>> + Send;

    fn load_delete_checkpoint(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<DeleteCheckpoint>, Report<QueryError>>> + Send;
}

/// Everything a digital-twins client needs from a backing store.
pub trait DigitalTwinsStore:
    ModelStore + TwinStore + RelationshipStore + JobStore + Send
{
}

impl<S> DigitalTwinsStore for S where
    S: ModelStore + TwinStore + RelationshipStore + JobStore + Send
{
}
