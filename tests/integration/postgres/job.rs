use core::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use twin_graph::{
    jobs::JobService,
    store::{JobStore as _, TwinStore as _, error},
};
use twin_types::job::{ImportOptions, JobStatus};

use crate::DatabaseTestWrapper;
use crate::model::solar_system;

fn import_stream(lines: &[serde_json::Value]) -> std::io::Cursor<Vec<u8>> {
    let mut bytes = Vec::new();
    for line in lines {
        bytes.extend_from_slice(line.to_string().as_bytes());
        bytes.push(b'\n');
    }
    std::io::Cursor::new(bytes)
}

fn full_import() -> std::io::Cursor<Vec<u8>> {
    let mut lines = vec![
        json!({"Section": "Header"}),
        json!({"fileVersion": "1.0.0", "author": "integration", "organization": "contoso"}),
        json!({"Section": "Models"}),
    ];
    lines.extend(solar_system());
    lines.extend([
        json!({"Section": "Twins"}),
        json!({"$dtId": "mars", "$metadata": {"$model": "dtmi:com:contoso:Planet;1"}, "name": "Mars"}),
        json!({"$dtId": "phobos", "$metadata": {"$model": "dtmi:com:contoso:Moon;1"}}),
        json!({"Section": "Relationships"}),
        json!({"$dtId": "mars", "$sourceId": "mars", "$relationshipId": "mars-phobos", "$targetId": "phobos", "$relationshipName": "satellites"}),
    ]);
    import_stream(&lines)
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn import_populates_the_graph() {
    let database = DatabaseTestWrapper::new().await;
    let service = JobService::new(database.pool(), database.graph().clone());

    let record = service
        .run_import(
            "import-1",
            full_import(),
            Vec::new(),
            ImportOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect("import runs to completion");

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.counters.models_created, 5);
    assert_eq!(record.counters.twins_created, 2);
    assert_eq!(record.counters.relationships_created, 1);
    assert_eq!(record.counters.error_count, 0);

    let store = database.store().await;
    store.get_twin("mars").await.expect("imported twin exists");
    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn malformed_streams_fail_with_argument_errors() {
    let database = DatabaseTestWrapper::new().await;
    let service = JobService::new(database.pool(), database.graph().clone());

    let report = service
        .run_import(
            "import-empty",
            import_stream(&[]),
            Vec::new(),
            ImportOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect_err("empty streams are rejected");
    let argument = report
        .downcast_ref::<error::ArgumentError>()
        .expect("an ArgumentError in the chain");
    assert_eq!(argument.message, "Empty input stream");

    let report = service
        .run_import(
            "import-no-header",
            import_stream(&[json!({"Section": "Models"})]),
            Vec::new(),
            ImportOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect_err("the Header sentinel must come first");
    let argument = report
        .downcast_ref::<error::ArgumentError>()
        .expect("an ArgumentError in the chain");
    assert_eq!(argument.message, "First section must be 'Header'");

    let report = service
        .run_import(
            "import-bad-version",
            import_stream(&[
                json!({"Section": "Header"}),
                json!({"fileVersion": "2.0.0"}),
            ]),
            Vec::new(),
            ImportOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect_err("only 1.0.0 is supported");
    let argument = report
        .downcast_ref::<error::ArgumentError>()
        .expect("an ArgumentError in the chain");
    assert_eq!(argument.message, "Unsupported file version");

    let report = service
        .run_import(
            "import-out-of-order",
            import_stream(&[
                json!({"Section": "Header"}),
                json!({"fileVersion": "1.0.0"}),
                json!({"Section": "Twins"}),
                json!({"Section": "Models"}),
            ]),
            Vec::new(),
            ImportOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect_err("sections must stay in order");
    assert!(report.contains::<error::ArgumentError>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn continue_on_failure_ends_partially_succeeded() {
    let database = DatabaseTestWrapper::new().await;
    let service = JobService::new(database.pool(), database.graph().clone());

    let lines = vec![
        json!({"Section": "Header"}),
        json!({"fileVersion": "1.0.0"}),
        json!({"Section": "Models"}),
        json!({
            "@id": "dtmi:com:contoso:Moon;1",
            "@type": "Interface",
            "@context": "dtmi:dtdl:context;3",
            "contents": []
        }),
        json!({"Section": "Twins"}),
        json!({"$dtId": "ok", "$metadata": {"$model": "dtmi:com:contoso:Moon;1"}}),
        json!({"$dtId": "bad", "$metadata": {"$model": "dtmi:com:contoso:Missing;1"}}),
    ];
    let record = service
        .run_import(
            "import-partial",
            import_stream(&lines),
            Vec::new(),
            ImportOptions {
                continue_on_failure: true,
                ..ImportOptions::default()
            },
            CancellationToken::new(),
        )
        .await
        .expect("record-level failures do not abort");

    assert_eq!(record.status, JobStatus::PartiallySucceeded);
    assert_eq!(record.counters.twins_created, 1);
    assert_eq!(record.counters.error_count, 1);

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn bulk_delete_drains_the_graph_in_phases() {
    let database = DatabaseTestWrapper::new().await;
    let service = JobService::new(database.pool(), database.graph().clone());
    service
        .run_import(
            "seed",
            full_import(),
            Vec::new(),
            ImportOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect("seed import succeeds");

    let record = service
        .run_delete("delete-1", CancellationToken::new())
        .await
        .expect("bulk delete runs to completion");
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.counters.relationships_deleted, 1);
    assert_eq!(record.counters.twins_deleted, 2);
    assert_eq!(record.counters.models_deleted, 5);

    let store = database.store().await;
    store
        .get_twin("mars")
        .await
        .expect_err("twins are gone after the Twins phase");

    let checkpoint = store
        .load_delete_checkpoint("delete-1")
        .await
        .expect("checkpoint loads")
        .expect("checkpoint exists");
    assert_eq!(
        checkpoint.current_section,
        twin_types::job::DeleteSection::Completed
    );

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn empty_database_delete_succeeds_with_zero_counters() {
    let database = DatabaseTestWrapper::new().await;
    let service = JobService::new(database.pool(), database.graph().clone());

    let record = service
        .run_delete("delete-empty", CancellationToken::new())
        .await
        .expect("empty delete runs to completion");
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.counters.relationships_deleted, 0);
    assert_eq!(record.counters.twins_deleted, 0);
    assert_eq!(record.counters.models_deleted, 0);

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn locks_exclude_until_their_ttl_elapses() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_job("locked", twin_types::job::JobType::Delete, &json!({}))
        .await
        .expect("job creates");

    assert!(
        store
            .try_acquire_lock("locked", Duration::from_secs(2))
            .await
            .expect("first acquisition succeeds")
    );
    assert!(
        !store
            .try_acquire_lock("locked", Duration::from_secs(2))
            .await
            .expect("second acquisition is refused while unexpired")
    );

    let info = store
        .get_lock_info("locked")
        .await
        .expect("lock info loads")
        .expect("lock row exists");
    assert!(!info.is_expired);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        store
            .try_acquire_lock("locked", Duration::from_secs(2))
            .await
            .expect("an expired lock can be taken over")
    );

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn duplicate_job_ids_are_rejected() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;

    store
        .create_job("job-1", twin_types::job::JobType::Import, &json!({}))
        .await
        .expect("job creates");
    let report = store
        .create_job("job-1", twin_types::job::JobType::Import, &json!({}))
        .await
        .expect_err("duplicate ids are rejected");
    assert!(report.contains::<error::InvalidOperation>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn background_import_returns_running_then_completes() {
    let database = DatabaseTestWrapper::new().await;
    let service = JobService::new(database.pool(), database.graph().clone());

    let record = service
        .run_import_in_background(
            "import-bg",
            || (full_import(), Vec::new()),
            ImportOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect("background import starts");
    assert_eq!(record.status, JobStatus::Running);

    let store = database.store().await;
    let mut status = record.status;
    for _ in 0..50 {
        status = store
            .get_job("import-bg")
            .await
            .expect("job record exists")
            .status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(status, JobStatus::Succeeded);

    database.teardown().await;
}
