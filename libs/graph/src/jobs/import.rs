//! The ND-JSON streaming importer.
//!
//! Input is one JSON value per line in strict section order: a `Header`
//! sentinel, the header object, then `Models`, `Twins`, and `Relationships`
//! sections, each optional but never out of order. Models are accumulated
//! and created as one atomic batch; twins and relationships are upserted per
//! record.

use error_stack::{Report, ResultExt as _};
use futures::StreamExt as _;
use serde_json::{Value as JsonValue, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use twin_types::job::{ImportOptions, JobCounters};

use super::{JobOutcome, cancel_requested};
use crate::store::{
    AsClient, JobStore as _, ModelStore as _, PostgresStore, RelationshipStore as _,
    TwinStore as _,
    error::ArgumentError,
};

const SUPPORTED_FILE_VERSION: &str = "1.0.0";

/// Section ranks enforce the fixed order; a marker may only increase the
/// rank.
fn section_rank(section: &str) -> Option<u8> {
    match section {
        "Header" => Some(0),
        "Models" => Some(1),
        "Twins" => Some(2),
        "Relationships" => Some(3),
        _ => None,
    }
}

struct ImportLog<W> {
    output: W,
    job_id: String,
}

impl<W: AsyncWrite + Send + Unpin> ImportLog<W> {
    async fn write(&mut self, level: &str, details: &str) {
        let entry = json!({
            "timestamp": OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            "jobId": self.job_id,
            "logType": level,
            "details": details,
        });
        let mut line = entry.to_string();
        line.push('\n');
        // the log sink is best-effort; a dead sink must not fail the job
        if let Err(error) = self.output.write_all(line.as_bytes()).await {
            tracing::warn!(job_id = %self.job_id, "could not write import log: {error}");
        }
    }
}

/// Executes an import job over `input`, logging per-record outcomes to
/// `output`.
///
/// # Errors
///
/// Returns [`ArgumentError`] when the stream itself is malformed (missing
/// header, unsupported version, out-of-order sections). Record-level
/// failures honor `continue_on_failure` and end in the returned outcome
/// instead.
#[expect(clippy::too_many_lines, reason = "the section state machine reads best in one piece")]
pub(crate) async fn execute_import<C, R, W>(
    store: &mut PostgresStore<C>,
    job_id: &str,
    input: R,
    output: W,
    options: &ImportOptions,
    cancellation: &CancellationToken,
) -> Result<JobOutcome, Report<ArgumentError>>
where
    C: AsClient,
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut lines = FramedRead::new(input, LinesCodec::new());
    let mut log = ImportLog {
        output,
        job_id: job_id.to_owned(),
    };

    // line 1: the Header sentinel
    let first = next_record(&mut lines).await?;
    let Some(first) = first else {
        return Err(Report::new(ArgumentError::new("Empty input stream")));
    };
    if first.get("Section").and_then(JsonValue::as_str) != Some("Header") {
        return Err(Report::new(ArgumentError::new(
            "First section must be 'Header'",
        )));
    }

    // line 2: the header object
    let header = next_record(&mut lines)
        .await?
        .ok_or_else(|| Report::new(ArgumentError::new("Missing header record")))?;
    let file_version = header
        .get("fileVersion")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    if file_version != SUPPORTED_FILE_VERSION {
        return Err(Report::new(ArgumentError::new("Unsupported file version")));
    }
    log.write("Info", &format!("Import job `{job_id}` started")).await;

    let mut current_rank = 0_u8;
    let mut model_documents: Vec<JsonValue> = Vec::new();
    let mut counters = JobCounters::default();
    let mut pending = JobCounters::default();
    let mut records_since_flush = 0_usize;

    loop {
        if cancel_requested(store, job_id, cancellation).await {
            flush_counters(store, job_id, &mut pending).await;
            log.write("Info", "Import job cancelled").await;
            return Ok(JobOutcome::cancelled());
        }

        let record = next_record(&mut lines).await?;
        let Some(record) = record else {
            break;
        };

        if let Some(section) = record.get("Section").and_then(JsonValue::as_str) {
            let rank = section_rank(section).ok_or_else(|| {
                Report::new(ArgumentError::new(format!("Unknown section '{section}'")))
            })?;
            if rank <= current_rank {
                return Err(Report::new(ArgumentError::new(format!(
                    "Section '{section}' is out of order"
                ))));
            }
            // leaving the Models section creates the accumulated batch
            if current_rank == 1 {
                if let Err(message) = import_models(
                    store,
                    &mut model_documents,
                    &mut counters,
                    &mut pending,
                    &mut log,
                    options,
                )
                .await
                {
                    flush_counters(store, job_id, &mut pending).await;
                    return Ok(JobOutcome::failed(message));
                }
            }
            current_rank = rank;
            continue;
        }

        let record_outcome = match current_rank {
            1 => {
                model_documents.push(record);
                Ok(())
            }
            2 => {
                let outcome = import_twin(store, &record, options).await;
                apply_record_outcome(
                    outcome,
                    &mut counters,
                    &mut pending,
                    |counters| counters.twins_created += 1,
                    &mut log,
                    options,
                )
                .await
            }
            3 => {
                let outcome = import_relationship(store, &record, options).await;
                apply_record_outcome(
                    outcome,
                    &mut counters,
                    &mut pending,
                    |counters| counters.relationships_created += 1,
                    &mut log,
                    options,
                )
                .await
            }
            _ => {
                return Err(Report::new(ArgumentError::new(
                    "Records must appear inside a section",
                )));
            }
        };
        if let Err(message) = record_outcome {
            flush_counters(store, job_id, &mut pending).await;
            return Ok(JobOutcome::failed(message));
        }

        records_since_flush += 1;
        if records_since_flush >= 100 {
            records_since_flush = 0;
            flush_counters(store, job_id, &mut pending).await;
        }
    }

    // EOF inside the Models section
    if current_rank == 1 {
        if let Err(message) = import_models(
            store,
            &mut model_documents,
            &mut counters,
            &mut pending,
            &mut log,
            options,
        )
        .await
        {
            flush_counters(store, job_id, &mut pending).await;
            return Ok(JobOutcome::failed(message));
        }
    }
    flush_counters(store, job_id, &mut pending).await;

    let summary = format!(
        "models: {}, twins: {}, relationships: {}, errors: {}",
        counters.models_created,
        counters.twins_created,
        counters.relationships_created,
        counters.error_count
    );
    log.write("Info", &format!("Import job finished ({summary})")).await;

    if counters.error_count > 0 {
        Ok(JobOutcome::partially_succeeded(summary))
    } else {
        Ok(JobOutcome::succeeded())
    }
}

/// Reads the next non-blank line and parses it as one JSON value.
async fn next_record<R: AsyncRead + Unpin>(
    lines: &mut FramedRead<R, LinesCodec>,
) -> Result<Option<JsonValue>, Report<ArgumentError>> {
    loop {
        let Some(line) = lines.next().await else {
            return Ok(None);
        };
        let line = line.change_context(ArgumentError::new("could not read the input stream"))?;
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map(Some)
            .change_context(ArgumentError::new("each line must be one JSON value"));
    }
}

/// Creates the accumulated model batch. The returned `Err` is a fatal
/// record-level failure that moves the job to `Failed`.
async fn import_models<C: AsClient, W: AsyncWrite + Send + Unpin>(
    store: &mut PostgresStore<C>,
    documents: &mut Vec<JsonValue>,
    counters: &mut JobCounters,
    pending: &mut JobCounters,
    log: &mut ImportLog<W>,
    options: &ImportOptions,
) -> Result<(), String> {
    if documents.is_empty() {
        return Ok(());
    }
    let batch = core::mem::take(documents);
    match store.create_models(&batch).await {
        Ok(created) => {
            counters.models_created += created.len() as u64;
            pending.models_created += created.len() as u64;
            log.write("Info", &format!("Created {} model(s)", created.len()))
                .await;
            Ok(())
        }
        Err(report) => {
            let message = report.to_string();
            log.write("Error", &message).await;
            if options.continue_on_failure {
                counters.error_count += 1;
                pending.error_count += 1;
                Ok(())
            } else {
                Err(message)
            }
        }
    }
}

async fn import_twin<C: AsClient>(
    store: &mut PostgresStore<C>,
    record: &JsonValue,
    options: &ImportOptions,
) -> Result<(), String> {
    let id = record
        .get("$dtId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| "twin record is missing `$dtId`".to_owned())?
        .to_owned();
    let operation = store.create_or_replace_twin(&id, record.clone(), None);
    match tokio::time::timeout(options.operation_timeout, operation).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(report)) => Err(format!("twin `{id}`: {report}")),
        Err(_) => Err(format!("twin `{id}`: the operation timed out")),
    }
}

async fn import_relationship<C: AsClient>(
    store: &mut PostgresStore<C>,
    record: &JsonValue,
    options: &ImportOptions,
) -> Result<(), String> {
    let source_id = record
        .get("$sourceId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| "relationship record is missing `$sourceId`".to_owned())?
        .to_owned();
    let relationship_id = record
        .get("$relationshipId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| "relationship record is missing `$relationshipId`".to_owned())?
        .to_owned();
    let operation = store.create_or_replace_relationship(
        &source_id,
        &relationship_id,
        record.clone(),
        None,
    );
    match tokio::time::timeout(options.operation_timeout, operation).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(report)) => Err(format!(
            "relationship `{relationship_id}` on `{source_id}`: {report}"
        )),
        Err(_) => Err(format!(
            "relationship `{relationship_id}` on `{source_id}`: the operation timed out"
        )),
    }
}

/// Books one record's result. The returned `Err` is a fatal record-level
/// failure that moves the job to `Failed`.
async fn apply_record_outcome<W: AsyncWrite + Send + Unpin>(
    outcome: Result<(), String>,
    counters: &mut JobCounters,
    pending: &mut JobCounters,
    on_success: impl Fn(&mut JobCounters),
    log: &mut ImportLog<W>,
    options: &ImportOptions,
) -> Result<(), String> {
    match outcome {
        Ok(()) => {
            on_success(counters);
            on_success(pending);
            Ok(())
        }
        Err(message) => {
            log.write("Error", &message).await;
            if options.continue_on_failure {
                counters.error_count += 1;
                pending.error_count += 1;
                Ok(())
            } else {
                Err(message)
            }
        }
    }
}

/// Pushes accumulated counter deltas onto the job record; failures are
/// logged and retried with the next flush.
async fn flush_counters<C: AsClient>(
    store: &mut PostgresStore<C>,
    job_id: &str,
    pending: &mut JobCounters,
) {
    if *pending == JobCounters::default() {
        return;
    }
    match store.add_job_counters(job_id, pending).await {
        Ok(()) => *pending = JobCounters::default(),
        Err(report) => {
            tracing::warn!(%job_id, "could not update job counters: {report:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::section_rank;

    #[test]
    fn sections_rank_in_fixed_order() {
        assert!(section_rank("Header") < section_rank("Models"));
        assert!(section_rank("Models") < section_rank("Twins"));
        assert!(section_rank("Twins") < section_rank("Relationships"));
        assert_eq!(section_rank("Other"), None);
    }
}
