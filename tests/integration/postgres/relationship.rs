use serde_json::json;
use twin_graph::store::{
    ModelStore as _, RelationshipStore as _, TwinStore as _, error,
};

use crate::DatabaseTestWrapper;
use crate::model::solar_system;

async fn seeded() -> (DatabaseTestWrapper, twin_graph::store::PooledStore) {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_models(&solar_system())
        .await
        .expect("model batch creates");
    store
        .create_or_replace_twin(
            "mars",
            json!({
                "$metadata": { "$model": "dtmi:com:contoso:Planet;1" },
                "name": "Mars",
            }),
            None,
        )
        .await
        .expect("twin creates");
    store
        .create_or_replace_twin(
            "phobos",
            json!({
                "$metadata": { "$model": "dtmi:com:contoso:Moon;1" },
            }),
            None,
        )
        .await
        .expect("twin creates");
    (database, store)
}

fn satellites() -> serde_json::Value {
    json!({
        "$targetId": "phobos",
        "$relationshipName": "satellites",
    })
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn create_fetch_and_list_round_trip() {
    let (database, mut store) = seeded().await;

    let created = store
        .create_or_replace_relationship("mars", "mars-phobos", satellites(), None)
        .await
        .expect("relationship conforms to the model");
    assert_eq!(created.source_id, "mars");
    assert_eq!(created.target_id, "phobos");
    assert!(created.etag.is_some());

    let fetched = store
        .get_relationship("mars", "mars-phobos")
        .await
        .expect("relationship exists");
    assert_eq!(fetched.etag, created.etag);
    assert_eq!(fetched.name, "satellites");

    let outgoing = store
        .list_relationships("mars", None)
        .await
        .expect("listing succeeds");
    assert_eq!(outgoing.len(), 1);

    let incoming = store
        .list_incoming_relationships("phobos")
        .await
        .expect("listing succeeds");
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].id, "mars-phobos");

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn undeclared_names_and_missing_endpoints_are_rejected() {
    let (database, mut store) = seeded().await;

    let report = store
        .create_or_replace_relationship(
            "mars",
            "bad",
            json!({ "$targetId": "phobos", "$relationshipName": "orbits" }),
            None,
        )
        .await
        .expect_err("`orbits` is not declared on Planet or its bases");
    assert!(report.contains::<error::ValidationFailed>());

    let report = store
        .create_or_replace_relationship(
            "mars",
            "bad",
            json!({ "$targetId": "ghost", "$relationshipName": "satellites" }),
            None,
        )
        .await
        .expect_err("the target twin does not exist");
    assert!(report.contains::<error::DigitalTwinNotFound>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn target_constraint_is_enforced() {
    let (database, mut store) = seeded().await;
    store
        .create_or_replace_twin(
            "venus",
            json!({
                "$metadata": { "$model": "dtmi:com:contoso:Planet;1" },
                "name": "Venus",
            }),
            None,
        )
        .await
        .expect("twin creates");

    // `satellites` targets Moon; a Planet target violates the constraint
    let report = store
        .create_or_replace_relationship(
            "mars",
            "bad",
            json!({ "$targetId": "venus", "$relationshipName": "satellites" }),
            None,
        )
        .await
        .expect_err("Planet is not a Moon");
    assert!(report.contains::<error::ValidationFailed>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn twin_with_relationships_cannot_be_deleted() {
    let (database, mut store) = seeded().await;
    store
        .create_or_replace_relationship("mars", "mars-phobos", satellites(), None)
        .await
        .expect("relationship creates");

    // both directions block the delete
    store
        .delete_twin("mars", None)
        .await
        .expect_err("source still has an outgoing edge");
    store
        .delete_twin("phobos", None)
        .await
        .expect_err("target still has an incoming edge");

    store
        .delete_relationship("mars", "mars-phobos", None)
        .await
        .expect("relationship deletes");
    store.delete_twin("phobos", None).await.expect("twin deletes");

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn empty_relationship_batch_is_rejected() {
    let (database, mut store) = seeded().await;

    let report = store
        .create_or_replace_relationships(Vec::new())
        .await
        .expect_err("empty batches are rejected");
    assert!(report.contains::<error::ArgumentError>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn if_none_match_star_guards_existing_edges() {
    let (database, mut store) = seeded().await;
    store
        .create_or_replace_relationship("mars", "mars-phobos", satellites(), None)
        .await
        .expect("relationship creates");

    let report = store
        .create_or_replace_relationship("mars", "mars-phobos", satellites(), Some("*"))
        .await
        .expect_err("the edge already exists");
    assert!(report.contains::<error::PreconditionFailed>());

    database.teardown().await;
}
