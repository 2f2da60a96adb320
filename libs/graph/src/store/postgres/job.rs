//! Durable job records, the distributed lock, and checkpoints.
//!
//! Everything here lives in the `<graph>_jobs` schema as plain relational
//! rows. Lock expiry is evaluated with the server's clock in every
//! predicate; callers never compute expiry locally.

use core::time::Duration;

use error_stack::{Report, ResultExt as _};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tokio_postgres::GenericClient;
use twin_types::job::{
    DeleteCheckpoint, JobCounters, JobLockInfo, JobRecord, JobStatus, JobType,
};

use super::{AsClient, PostgresStore, age::quote_ident};
use crate::store::{
    JobStore,
    error::{
        DeletionError, InsertionError, InvalidOperation, QueryError, UpdateError,
    },
};

fn job_status_from_str(status: &str) -> JobStatus {
    match status {
        "Running" => JobStatus::Running,
        "Succeeded" => JobStatus::Succeeded,
        "PartiallySucceeded" => JobStatus::PartiallySucceeded,
        "Failed" => JobStatus::Failed,
        "Cancelled" => JobStatus::Cancelled,
        _ => JobStatus::NotStarted,
    }
}

fn job_record_from_row(row: &tokio_postgres::Row) -> JobRecord {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    JobRecord {
        id: row.get("id"),
        job_type: if job_type == "delete" {
            JobType::Delete
        } else {
            JobType::Import
        },
        status: job_status_from_str(&status),
        created_at: row.get("created_at"),
        last_action_at: row.get("last_action_at"),
        finished_at: row.get("finished_at"),
        purge_at: row.get("purge_at"),
        counters: JobCounters {
            models_created: row.get::<_, i64>("models_created") as u64,
            models_deleted: row.get::<_, i64>("models_deleted") as u64,
            twins_created: row.get::<_, i64>("twins_created") as u64,
            twins_deleted: row.get::<_, i64>("twins_deleted") as u64,
            relationships_created: row.get::<_, i64>("relationships_created") as u64,
            relationships_deleted: row.get::<_, i64>("relationships_deleted") as u64,
            error_count: row.get::<_, i64>("error_count") as u64,
        },
        options: row.get("options"),
        failure_reason: row.get("failure_reason"),
    }
}

impl<C: AsClient> PostgresStore<C> {
    fn jobs_table(&self) -> String {
        format!("{}.jobs", quote_ident(&self.graph().jobs_schema()))
    }

    fn locks_table(&self) -> String {
        format!("{}.job_locks", quote_ident(&self.graph().jobs_schema()))
    }

    fn checkpoints_table(&self) -> String {
        format!("{}.checkpoints", quote_ident(&self.graph().jobs_schema()))
    }
}

impl<C: AsClient> JobStore for PostgresStore<C> {
    #[tracing::instrument(level = "info", skip(self, options))]
    async fn create_job(
        &mut self,
        id: &str,
        job_type: JobType,
        options: &JsonValue,
    ) -> Result<JobRecord, Report<InsertionError>> {
        let statement = format!(
            "INSERT INTO {jobs} (id, job_type, status, options) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO NOTHING \
             RETURNING *",
            jobs = self.jobs_table()
        );
        let row = self
            .client
            .as_client()
            .query_opt(
                statement.as_str(),
                &[
                    &id as &(dyn postgres_types::ToSql + Sync),
                    &job_type.as_str(),
                    &JobStatus::NotStarted.as_str(),
                    options,
                ],
            )
            .await
            .change_context(InsertionError)?;
        row.map(|row| job_record_from_row(&row)).ok_or_else(|| {
            Report::new(InvalidOperation::new(format!("job `{id}` already exists")))
                .change_context(InsertionError)
        })
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn get_job(&self, id: &str) -> Result<JobRecord, Report<QueryError>> {
        let statement = format!("SELECT * FROM {jobs} WHERE id = $1", jobs = self.jobs_table());
        let row = self
            .client
            .as_client()
            .query_opt(statement.as_str(), &[&id])
            .await
            .change_context(QueryError)?;
        row.map(|row| job_record_from_row(&row)).ok_or_else(|| {
            Report::new(InvalidOperation::new(format!("job `{id}` does not exist")))
                .change_context(QueryError)
        })
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn list_jobs(
        &self,
        job_type: Option<JobType>,
    ) -> Result<Vec<JobRecord>, Report<QueryError>> {
        let rows = match job_type {
            Some(job_type) => {
                let statement = format!(
                    "SELECT * FROM {jobs} WHERE job_type = $1 ORDER BY created_at",
                    jobs = self.jobs_table()
                );
                self.client
                    .as_client()
                    .query(statement.as_str(), &[&job_type.as_str()])
                    .await
            }
            None => {
                let statement = format!(
                    "SELECT * FROM {jobs} ORDER BY created_at",
                    jobs = self.jobs_table()
                );
                self.client.as_client().query(statement.as_str(), &[]).await
            }
        }
        .change_context(QueryError)?;
        Ok(rows.iter().map(job_record_from_row).collect())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn update_job_status(
        &mut self,
        id: &str,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> Result<JobRecord, Report<UpdateError>> {
        let current = self.get_job(id).await.change_context(UpdateError)?;
        if !current.status.can_transition_to(status) {
            return Err(Report::new(InvalidOperation::new(format!(
                "job `{id}` cannot transition from {} to {}",
                current.status.as_str(),
                status.as_str()
            )))
            .change_context(UpdateError));
        }

        let finished: Option<OffsetDateTime> =
            status.is_terminal().then(OffsetDateTime::now_utc);
        let statement = format!(
            "UPDATE {jobs} SET status = $2, last_action_at = now(), \
             finished_at = COALESCE($3, finished_at), \
             failure_reason = COALESCE($4, failure_reason) \
             WHERE id = $1 RETURNING *",
            jobs = self.jobs_table()
        );
        let row = self
            .client
            .as_client()
            .query_one(
                statement.as_str(),
                &[
                    &id as &(dyn postgres_types::ToSql + Sync),
                    &status.as_str(),
                    &finished,
                    &failure_reason,
                ],
            )
            .await
            .change_context(UpdateError)?;
        Ok(job_record_from_row(&row))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn add_job_counters(
        &mut self,
        id: &str,
        deltas: &JobCounters,
    ) -> Result<(), Report<UpdateError>> {
        let statement = format!(
            "UPDATE {jobs} SET \
             models_created = models_created + $2, \
             models_deleted = models_deleted + $3, \
             twins_created = twins_created + $4, \
             twins_deleted = twins_deleted + $5, \
             relationships_created = relationships_created + $6, \
             relationships_deleted = relationships_deleted + $7, \
             error_count = error_count + $8, \
             last_action_at = now() \
             WHERE id = $1",
            jobs = self.jobs_table()
        );
        self.client
            .as_client()
            .execute(
                statement.as_str(),
                &[
                    &id as &(dyn postgres_types::ToSql + Sync),
                    &(deltas.models_created as i64),
                    &(deltas.models_deleted as i64),
                    &(deltas.twins_created as i64),
                    &(deltas.twins_deleted as i64),
                    &(deltas.relationships_created as i64),
                    &(deltas.relationships_deleted as i64),
                    &(deltas.error_count as i64),
                ],
            )
            .await
            .change_context(UpdateError)?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_job(&mut self, id: &str) -> Result<(), Report<DeletionError>> {
        let jobs = self.jobs_table();
        let checkpoints = self.checkpoints_table();
        let locks = self.locks_table();
        for statement in [
            format!("DELETE FROM {checkpoints} WHERE job_id = $1"),
            format!("DELETE FROM {locks} WHERE job_id = $1"),
            format!("DELETE FROM {jobs} WHERE id = $1"),
        ] {
            self.client
                .as_client()
                .execute(statement.as_str(), &[&id])
                .await
                .change_context(DeletionError)?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn try_acquire_lock(
        &mut self,
        job_id: &str,
        ttl: Duration,
    ) -> Result<bool, Report<InsertionError>> {
        let statement = format!(
            "INSERT INTO {locks} (job_id, owner_instance_id, ttl_seconds) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (job_id) DO UPDATE SET \
                 owner_instance_id = EXCLUDED.owner_instance_id, \
                 acquired_at = now(), \
                 heartbeat_at = now(), \
                 ttl_seconds = EXCLUDED.ttl_seconds \
             WHERE {locks}.heartbeat_at \
                 + make_interval(secs => {locks}.ttl_seconds::double precision) <= now() \
             RETURNING job_id",
            locks = self.locks_table()
        );
        let row = self
            .client
            .as_client()
            .query_opt(
                statement.as_str(),
                &[
                    &job_id as &(dyn postgres_types::ToSql + Sync),
                    &self.instance_id(),
                    &(ttl.as_secs() as i64),
                ],
            )
            .await
            .change_context(InsertionError)?;
        Ok(row.is_some())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn renew_lock(&mut self, job_id: &str) -> Result<bool, Report<UpdateError>> {
        let statement = format!(
            "UPDATE {locks} SET heartbeat_at = now() \
             WHERE job_id = $1 AND owner_instance_id = $2",
            locks = self.locks_table()
        );
        let updated = self
            .client
            .as_client()
            .execute(statement.as_str(), &[&job_id, &self.instance_id()])
            .await
            .change_context(UpdateError)?;
        Ok(updated == 1)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn release_lock(&mut self, job_id: &str) -> Result<bool, Report<DeletionError>> {
        let statement = format!(
            "DELETE FROM {locks} WHERE job_id = $1 AND owner_instance_id = $2",
            locks = self.locks_table()
        );
        let deleted = self
            .client
            .as_client()
            .execute(statement.as_str(), &[&job_id, &self.instance_id()])
            .await
            .change_context(DeletionError)?;
        Ok(deleted == 1)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn cleanup_expired_locks(&mut self) -> Result<u64, Report<DeletionError>> {
        let statement = format!(
            "DELETE FROM {locks} \
             WHERE heartbeat_at + make_interval(secs => ttl_seconds::double precision) <= now()",
            locks = self.locks_table()
        );
        self.client
            .as_client()
            .execute(statement.as_str(), &[])
            .await
            .change_context(DeletionError)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn get_lock_info(
        &self,
        job_id: &str,
    ) -> Result<Option<JobLockInfo>, Report<QueryError>> {
        let statement = format!(
            "SELECT job_id, owner_instance_id, acquired_at, heartbeat_at, ttl_seconds, \
                 heartbeat_at + make_interval(secs => ttl_seconds::double precision) <= now() \
                     AS is_expired \
             FROM {locks} WHERE job_id = $1",
            locks = self.locks_table()
        );
        let row = self
            .client
            .as_client()
            .query_opt(statement.as_str(), &[&job_id])
            .await
            .change_context(QueryError)?;
        Ok(row.map(|row| JobLockInfo {
            job_id: row.get("job_id"),
            owner_instance_id: row.get("owner_instance_id"),
            acquired_at: row.get("acquired_at"),
            heartbeat_at: row.get("heartbeat_at"),
            ttl_seconds: row.get::<_, i64>("ttl_seconds") as u64,
            is_expired: row.get("is_expired"),
        }))
    }

    #[tracing::instrument(level = "trace", skip(self, checkpoint))]
    async fn save_checkpoint(
        &mut self,
        checkpoint: &DeleteCheckpoint,
    ) -> Result<(), Report<UpdateError>> {
        let document = serde_json::to_value(checkpoint).change_context(UpdateError)?;
        let statement = format!(
            "INSERT INTO {checkpoints} (job_id, checkpoint) VALUES ($1, $2) \
             ON CONFLICT (job_id) DO UPDATE SET \
                 checkpoint = EXCLUDED.checkpoint, updated_at = now()",
            checkpoints = self.checkpoints_table()
        );
        self.client
            .as_client()
            .execute(
                statement.as_str(),
                &[
                    &checkpoint.job_id as &(dyn postgres_types::ToSql + Sync),
                    &document,
                ],
            )
            .await
            .change_context(UpdateError)?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn load_delete_checkpoint(
        &self,
        job_id: &str,
    ) -> Result<Option<DeleteCheckpoint>, Report<QueryError>> {
        let statement = format!(
            "SELECT checkpoint FROM {checkpoints} WHERE job_id = $1",
            checkpoints = self.checkpoints_table()
        );
        let row = self
            .client
            .as_client()
            .query_opt(statement.as_str(), &[&job_id])
            .await
            .change_context(QueryError)?;
        row.map(|row| {
            serde_json::from_value::<DeleteCheckpoint>(row.get("checkpoint"))
                .change_context(QueryError)
        })
        .transpose()
    }
}
