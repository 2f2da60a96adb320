use serde_json::json;
use twin_graph::store::{ModelStore as _, TwinStore as _, error};

use crate::DatabaseTestWrapper;
use crate::model::solar_system;

async fn seeded() -> (DatabaseTestWrapper, twin_graph::store::PooledStore) {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_models(&solar_system())
        .await
        .expect("model batch creates");
    (database, store)
}

fn earth() -> serde_json::Value {
    json!({
        "$metadata": { "$model": "dtmi:com:contoso:HabitablePlanet;1" },
        "name": "Earth",
        "mass": 5.972e24,
        "hasLife": true,
        "deepestCrater": { "$metadata": {}, "diameter": 160.0 },
    })
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn upsert_then_fetch_round_trips() {
    let (database, mut store) = seeded().await;

    let created = store
        .create_or_replace_twin("earth", earth(), None)
        .await
        .expect("twin conforms to its model");
    let fetched = store.get_twin("earth").await.expect("twin exists");

    assert_eq!(fetched.dt_id(), Some("earth"));
    assert_eq!(fetched.etag(), created.etag());
    assert_eq!(fetched.property("name"), Some(&json!("Earth")));
    assert_eq!(fetched.property("hasLife"), Some(&json!(true)));

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn twin_without_model_reference_is_rejected() {
    let (database, mut store) = seeded().await;

    let report = store
        .create_or_replace_twin("bare", json!({ "name": "no model" }), None)
        .await
        .expect_err("`$metadata.$model` is required");
    assert!(report.contains::<error::ArgumentError>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn validation_collects_every_offending_property() {
    let (database, mut store) = seeded().await;

    let report = store
        .create_or_replace_twin(
            "broken",
            json!({
                "$metadata": { "$model": "dtmi:com:contoso:HabitablePlanet;1" },
                "mass": "heavy",
                "undeclared": 1,
            }),
            None,
        )
        .await
        .expect_err("two offending properties");
    let message = format!("{report:?}");
    assert!(message.contains("mass"), "{message}");
    assert!(message.contains("undeclared"), "{message}");

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn decommissioned_models_accept_no_new_twins() {
    let (database, mut store) = seeded().await;
    store
        .update_model(
            &"dtmi:com:contoso:HabitablePlanet;1".parse().expect("valid DTMI"),
            true,
        )
        .await
        .expect("decommission succeeds");

    let report = store
        .create_or_replace_twin("earth", earth(), None)
        .await
        .expect_err("decommissioned models are closed");
    assert!(report.contains::<error::ValidationFailed>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn if_none_match_star_guards_creation() {
    let (database, mut store) = seeded().await;
    store
        .create_or_replace_twin("earth", earth(), None)
        .await
        .expect("twin creates");

    let report = store
        .create_or_replace_twin("earth", earth(), Some("*"))
        .await
        .expect_err("twin already exists");
    assert!(report.contains::<error::PreconditionFailed>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn patch_refreshes_only_changed_properties() {
    let (database, mut store) = seeded().await;
    let created = store
        .create_or_replace_twin("earth", earth(), None)
        .await
        .expect("twin creates");

    let etag = created.etag().expect("twin has an etag");
    let patch: json_patch::Patch = serde_json::from_value(json!([
        { "op": "replace", "path": "/name", "value": "Terra" },
    ]))
    .expect("well-formed patch");
    let updated = store
        .update_twin("earth", &patch, Some(etag.as_str()))
        .await
        .expect("patch applies");

    assert_eq!(updated.property("name"), Some(&json!("Terra")));
    assert_ne!(updated.etag(), created.etag());

    // the original tag is stale afterwards
    let report = store
        .update_twin("earth", &patch, Some(etag.as_str()))
        .await
        .expect_err("etag is stale");
    assert!(report.contains::<error::PreconditionFailed>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn component_read_and_patch() {
    let (database, mut store) = seeded().await;
    store
        .create_or_replace_twin("earth", earth(), None)
        .await
        .expect("twin creates");

    let component = store
        .get_component("earth", "deepestCrater")
        .await
        .expect("component exists on the model");
    assert_eq!(component["diameter"], json!(160.0));

    let report = store
        .get_component("earth", "atmosphere")
        .await
        .expect_err("not a component of the model");
    assert!(report.contains::<error::ComponentNotFound>());

    let patch: json_patch::Patch = serde_json::from_value(json!([
        { "op": "replace", "path": "/diameter", "value": 170.5 },
    ]))
    .expect("well-formed patch");
    let patched = store
        .update_component("earth", "deepestCrater", &patch, None)
        .await
        .expect("component patch applies");
    assert_eq!(patched["diameter"], json!(170.5));

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn batch_limit_is_one_hundred() {
    let (database, mut store) = seeded().await;

    let batch: Vec<_> = (0..101)
        .map(|index| {
            json!({
                "$dtId": format!("twin-{index}"),
                "$metadata": { "$model": "dtmi:com:contoso:Moon;1" },
            })
        })
        .collect();
    let report = store
        .create_or_replace_twins(batch)
        .await
        .expect_err("101 exceeds the batch limit");
    assert!(report.contains::<error::ArgumentError>());
    let message = format!("{report:?}");
    assert!(message.contains("101"), "{message}");
    assert!(message.contains("100"), "{message}");

    let batch: Vec<_> = (0..100)
        .map(|index| {
            json!({
                "$dtId": format!("twin-{index}"),
                "$metadata": { "$model": "dtmi:com:contoso:Moon;1" },
            })
        })
        .collect();
    let result = store
        .create_or_replace_twins(batch)
        .await
        .expect("exactly 100 is accepted");
    assert_eq!(result.successes.len(), 100);
    assert!(result.failures.is_empty());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn batch_failures_are_per_item() {
    let (database, mut store) = seeded().await;

    let result = store
        .create_or_replace_twins(vec![
            json!({
                "$dtId": "moon-1",
                "$metadata": { "$model": "dtmi:com:contoso:Moon;1" },
            }),
            json!({
                "$dtId": "broken",
                "$metadata": { "$model": "dtmi:com:contoso:Missing;1" },
            }),
        ])
        .await
        .expect("the batch itself is accepted");
    assert_eq!(result.successes.len(), 1);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].index, 1);

    database.teardown().await;
}
