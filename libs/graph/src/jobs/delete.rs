//! The three-phase bulk deleter: relationships, then twins, then models
//! (children before parents), with a durable checkpoint after every batch.

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use twin_types::job::{DeleteCheckpoint, DeleteSection, JobCounters};

use super::{JobOutcome, cancel_requested};
use crate::store::{AsClient, JobStore as _, PostgresStore};

const BATCH_SIZE: usize = 100;

pub(crate) async fn execute_delete<C: AsClient>(
    store: &mut PostgresStore<C>,
    job_id: &str,
    cancellation: &CancellationToken,
) -> JobOutcome {
    let mut checkpoint = match store.load_delete_checkpoint(job_id).await {
        Ok(Some(checkpoint)) => checkpoint,
        Ok(None) => DeleteCheckpoint::new(job_id, OffsetDateTime::now_utc()),
        Err(report) => return JobOutcome::failed(report.to_string()),
    };

    while checkpoint.current_section != DeleteSection::Completed {
        if cancel_requested(store, job_id, cancellation).await {
            checkpoint.last_updated = OffsetDateTime::now_utc();
            let _ = store.save_checkpoint(&checkpoint).await;
            return JobOutcome::cancelled();
        }

        let batch = match checkpoint.current_section {
            DeleteSection::Relationships => store.delete_relationships_batch(BATCH_SIZE).await,
            DeleteSection::Twins => store.delete_twins_batch(BATCH_SIZE).await,
            DeleteSection::Models => store.delete_models_batch(BATCH_SIZE).await,
            DeleteSection::Completed => break,
        };
        let deleted = match batch {
            Ok(deleted) => deleted,
            Err(report) => {
                checkpoint.last_updated = OffsetDateTime::now_utc();
                let _ = store.save_checkpoint(&checkpoint).await;
                return JobOutcome::failed(report.to_string());
            }
        };

        let mut deltas = JobCounters::default();
        match checkpoint.current_section {
            DeleteSection::Relationships => {
                checkpoint.relationships_deleted += deleted;
                deltas.relationships_deleted = deleted;
                if deleted == 0 {
                    checkpoint.relationships_completed = true;
                    checkpoint.current_section = DeleteSection::Twins;
                }
            }
            DeleteSection::Twins => {
                checkpoint.twins_deleted += deleted;
                deltas.twins_deleted = deleted;
                if deleted == 0 {
                    checkpoint.twins_completed = true;
                    checkpoint.current_section = DeleteSection::Models;
                }
            }
            DeleteSection::Models => {
                checkpoint.models_deleted += deleted;
                deltas.models_deleted = deleted;
                if deleted == 0 {
                    checkpoint.models_completed = true;
                    checkpoint.current_section = DeleteSection::Completed;
                }
            }
            DeleteSection::Completed => {}
        }
        checkpoint.last_updated = OffsetDateTime::now_utc();

        if let Err(report) = store.save_checkpoint(&checkpoint).await {
            return JobOutcome::failed(report.to_string());
        }
        if deltas != JobCounters::default() {
            if let Err(report) = store.add_job_counters(job_id, &deltas).await {
                tracing::warn!(%job_id, "could not update job counters: {report:?}");
            }
        }

        // yield between batches so long deletes stay cooperative
        tokio::task::yield_now().await;
    }

    JobOutcome::succeeded()
}
