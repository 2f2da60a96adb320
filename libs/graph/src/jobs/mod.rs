//! Durable, resumable batch jobs.
//!
//! The service guards every run with the distributed lock, keeps the lock
//! alive with a heartbeat task while the workload executes, and drives the
//! final status transition. Workloads are the ND-JSON importer and the
//! three-phase bulk deleter; both yield at batch boundaries and poll for
//! cancellation.

mod delete;
mod import;

use std::{sync::Arc, time::Duration};

use error_stack::{Report, ResultExt as _};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use twin_types::job::{ImportOptions, JobRecord, JobStatus, JobType};

use crate::store::{
    GraphName, JobStore as _, PostgresStorePool,
    error::InvalidOperation,
};

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("the job could not be executed")]
#[must_use]
pub struct JobError;

/// What a workload reports back to the service.
#[derive(Debug)]
pub(crate) struct JobOutcome {
    status: JobStatus,
    failure_reason: Option<String>,
}

impl JobOutcome {
    pub(crate) const fn succeeded() -> Self {
        Self {
            status: JobStatus::Succeeded,
            failure_reason: None,
        }
    }

    pub(crate) const fn cancelled() -> Self {
        Self {
            status: JobStatus::Cancelled,
            failure_reason: None,
        }
    }

    pub(crate) fn partially_succeeded(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::PartiallySucceeded,
            failure_reason: Some(reason.into()),
        }
    }

    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Orchestrates import and bulk-delete jobs against one tenant graph.
#[derive(Clone)]
pub struct JobService {
    pool: Arc<PostgresStorePool>,
    graph: GraphName,
    lock_ttl: Duration,
    heartbeat_interval: Duration,
}

impl JobService {
    #[must_use]
    pub fn new(pool: Arc<PostgresStorePool>, graph: GraphName) -> Self {
        Self {
            pool,
            graph,
            lock_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Runs an import job synchronously and returns the final record.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when the job cannot be started; workload
    /// failures end in the returned record's status instead.
    #[tracing::instrument(level = "info", skip(self, input, output))]
    pub async fn run_import<R, W>(
        &self,
        job_id: &str,
        input: R,
        output: W,
        options: ImportOptions,
        cancellation: CancellationToken,
    ) -> Result<JobRecord, Report<JobError>>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let config = serde_json::to_value(&options).unwrap_or_else(|_| json!({}));
        self.ensure_job(job_id, JobType::Import, &config).await?;
        self.start(job_id).await?;
        let heartbeat = self.spawn_heartbeat(job_id.to_owned());

        let mut store = self
            .pool
            .acquire(self.graph.clone())
            .await
            .change_context(JobError)?;
        let outcome =
            import::execute_import(&mut store, job_id, input, output, &options, &cancellation)
                .await;
        heartbeat.cancel();
        match outcome {
            Ok(outcome) => self.finish(job_id, outcome).await,
            // a malformed stream surfaces to the caller after the job is
            // marked Failed
            Err(report) => {
                self.finish(job_id, JobOutcome::failed(report.to_string()))
                    .await?;
                Err(report.change_context(JobError))
            }
        }
    }

    /// Starts an import job and returns the `Running` record immediately;
    /// the workload executes on a separately scheduled task.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when the job cannot be started.
    #[tracing::instrument(level = "info", skip(self, stream_factory))]
    pub async fn run_import_in_background<F, R, W>(
        &self,
        job_id: &str,
        stream_factory: F,
        options: ImportOptions,
        cancellation: CancellationToken,
    ) -> Result<JobRecord, Report<JobError>>
    where
        F: FnOnce() -> (R, W) + Send + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let config = serde_json::to_value(&options).unwrap_or_else(|_| json!({}));
        self.ensure_job(job_id, JobType::Import, &config).await?;
        let record = self.start(job_id).await?;

        let service = self.clone();
        let job_id = job_id.to_owned();
        tokio::spawn(async move {
            let heartbeat = service.spawn_heartbeat(job_id.clone());
            let outcome = match service.pool.acquire(service.graph.clone()).await {
                Ok(mut store) => {
                    let (input, output) = stream_factory();
                    import::execute_import(
                        &mut store,
                        &job_id,
                        input,
                        output,
                        &options,
                        &cancellation,
                    )
                    .await
                    .unwrap_or_else(|report| JobOutcome::failed(report.to_string()))
                }
                Err(report) => JobOutcome::failed(report.to_string()),
            };
            heartbeat.cancel();
            if let Err(report) = service.finish(&job_id, outcome).await {
                tracing::error!(%job_id, "could not finalize background import: {report:?}");
            }
        });
        Ok(record)
    }

    /// Runs a bulk-delete job synchronously, resuming from a persisted
    /// checkpoint when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when the job cannot be started.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_delete(
        &self,
        job_id: &str,
        cancellation: CancellationToken,
    ) -> Result<JobRecord, Report<JobError>> {
        self.ensure_job(job_id, JobType::Delete, &json!({})).await?;
        let _record = self.start(job_id).await?;
        let heartbeat = self.spawn_heartbeat(job_id.to_owned());

        let mut store = self
            .pool
            .acquire(self.graph.clone())
            .await
            .change_context(JobError)?;
        let outcome = delete::execute_delete(&mut store, job_id, &cancellation).await;
        heartbeat.cancel();
        self.finish(job_id, outcome).await
    }

    /// Starts a bulk-delete job in the background and returns the `Running`
    /// record immediately.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when the job cannot be started.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_delete_in_background(
        &self,
        job_id: &str,
        cancellation: CancellationToken,
    ) -> Result<JobRecord, Report<JobError>> {
        self.ensure_job(job_id, JobType::Delete, &json!({})).await?;
        let record = self.start(job_id).await?;

        let service = self.clone();
        let job_id = job_id.to_owned();
        tokio::spawn(async move {
            let heartbeat = service.spawn_heartbeat(job_id.clone());
            let outcome = match service.pool.acquire(service.graph.clone()).await {
                Ok(mut store) => delete::execute_delete(&mut store, &job_id, &cancellation).await,
                Err(report) => JobOutcome::failed(report.to_string()),
            };
            heartbeat.cancel();
            if let Err(report) = service.finish(&job_id, outcome).await {
                tracing::error!(%job_id, "could not finalize background delete: {report:?}");
            }
        });
        Ok(record)
    }

    /// Requests cancellation of a job by flipping its status; the running
    /// workload observes the transition at its next batch boundary.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when the job does not exist or is already
    /// terminal.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord, Report<JobError>> {
        let mut store = self
            .pool
            .acquire(self.graph.clone())
            .await
            .change_context(JobError)?;
        store
            .update_job_status(job_id, JobStatus::Cancelled, None)
            .await
            .change_context(JobError)
    }

    /// Creates the job record unless it already exists in `NotStarted`;
    /// re-running a terminal job is rejected.
    async fn ensure_job(
        &self,
        job_id: &str,
        job_type: JobType,
        options: &serde_json::Value,
    ) -> Result<(), Report<JobError>> {
        let mut store = self
            .pool
            .acquire(self.graph.clone())
            .await
            .change_context(JobError)?;
        match store.create_job(job_id, job_type, options).await {
            Ok(_) => Ok(()),
            Err(report) if report.contains::<InvalidOperation>() => {
                let existing = store.get_job(job_id).await.change_context(JobError)?;
                if existing.status == JobStatus::NotStarted
                    || existing.status == JobStatus::Running
                {
                    Ok(())
                } else {
                    Err(report.change_context(JobError))
                }
            }
            Err(report) => Err(report.change_context(JobError)),
        }
    }

    /// Acquires the lock and moves the job to `Running`.
    async fn start(&self, job_id: &str) -> Result<JobRecord, Report<JobError>> {
        let mut store = self
            .pool
            .acquire(self.graph.clone())
            .await
            .change_context(JobError)?;
        store
            .cleanup_expired_locks()
            .await
            .change_context(JobError)?;
        let acquired = store
            .try_acquire_lock(job_id, self.lock_ttl)
            .await
            .change_context(JobError)?;
        if !acquired {
            return Err(Report::new(InvalidOperation::new(format!(
                "job `{job_id}` is already being executed by another instance"
            )))
            .change_context(JobError));
        }
        store
            .update_job_status(job_id, JobStatus::Running, None)
            .await
            .change_context(JobError)
    }

    /// Applies the outcome and releases the lock.
    async fn finish(
        &self,
        job_id: &str,
        outcome: JobOutcome,
    ) -> Result<JobRecord, Report<JobError>> {
        let mut store = self
            .pool
            .acquire(self.graph.clone())
            .await
            .change_context(JobError)?;
        let record = store
            .update_job_status(job_id, outcome.status, outcome.failure_reason.as_deref())
            .await
            .change_context(JobError)?;
        store
            .release_lock(job_id)
            .await
            .change_context(JobError)?;
        Ok(record)
    }

    /// Renews the job lock on an interval until cancelled.
    fn spawn_heartbeat(&self, job_id: String) -> CancellationToken {
        let token = CancellationToken::new();
        let done = token.clone();
        let pool = Arc::clone(&self.pool);
        let graph = self.graph.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = done.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                match pool.acquire(graph.clone()).await {
                    Ok(mut store) => {
                        if let Err(report) = store.renew_lock(&job_id).await {
                            tracing::warn!(%job_id, "lock renewal failed: {report:?}");
                        }
                    }
                    Err(report) => {
                        tracing::warn!(%job_id, "heartbeat could not reach the store: {report:?}");
                    }
                }
            }
        });
        token
    }
}

/// Whether a running workload should stop: local token or a `Cancelled`
/// status written by another instance.
pub(crate) async fn cancel_requested<C: crate::store::AsClient>(
    store: &crate::store::PostgresStore<C>,
    job_id: &str,
    cancellation: &CancellationToken,
) -> bool {
    if cancellation.is_cancelled() {
        return true;
    }
    matches!(
        store.get_job(job_id).await.map(|record| record.status),
        Ok(JobStatus::Cancelled)
    )
}
