use futures::{StreamExt as _, TryStreamExt as _};
use serde_json::{Value as JsonValue, json};
use twin_graph::store::{ModelStore as _, TwinStore as _};

use crate::DatabaseTestWrapper;
use crate::model::solar_system;

/// Seeds the CelestialBody / Planet / HabitablePlanet hierarchy with one
/// twin per model.
async fn seeded() -> (DatabaseTestWrapper, twin_graph::store::PooledStore) {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_models(&solar_system())
        .await
        .expect("model batch creates");
    for (id, model) in [
        ("halley", "dtmi:com:contoso:CelestialBody;1"),
        ("mars", "dtmi:com:contoso:Planet;1"),
        ("earth", "dtmi:com:contoso:HabitablePlanet;1"),
    ] {
        store
            .create_or_replace_twin(
                id,
                json!({ "$metadata": { "$model": model }, "name": id }),
                None,
            )
            .await
            .expect("twin creates");
    }
    (database, store)
}

fn dt_ids(rows: &[JsonValue]) -> Vec<String> {
    let mut ids: Vec<String> = rows
        .iter()
        .filter_map(|row| {
            row.as_object()?
                .values()
                .next()?
                .get("properties")?
                .get("$dtId")?
                .as_str()
                .map(str::to_owned)
        })
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn is_of_model_spans_the_inheritance_chain() {
    let (database, store) = seeded().await;

    let rows: Vec<JsonValue> = store
        .query("SELECT * FROM DIGITALTWINS WHERE IS_OF_MODEL('dtmi:com:contoso:CelestialBody;1')")
        .await
        .expect("query executes")
        .try_collect()
        .await
        .expect("rows stream");
    assert_eq!(dt_ids(&rows), vec!["earth", "halley", "mars"]);

    let rows: Vec<JsonValue> = store
        .query(
            "SELECT * FROM DIGITALTWINS WHERE IS_OF_MODEL('dtmi:com:contoso:CelestialBody;1', \
             exact)",
        )
        .await
        .expect("query executes")
        .try_collect()
        .await
        .expect("rows stream");
    assert_eq!(dt_ids(&rows), vec!["halley"]);

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn old_and_new_subtype_tests_agree() {
    let (database, store) = seeded().await;

    for model in [
        "dtmi:com:contoso:CelestialBody;1",
        "dtmi:com:contoso:Planet;1",
        "dtmi:com:contoso:HabitablePlanet;1",
        "dtmi:com:contoso:Moon;1",
    ] {
        for exact in [false, true] {
            let exact_argument = if exact { ",true" } else { "" };
            let graph = database.graph();
            let new_rows: Vec<JsonValue> = store
                .query(&format!(
                    "MATCH (T:Twin) WHERE {graph}.is_of_model(T,'{model}'{exact_argument}) \
                     RETURN T"
                ))
                .await
                .expect("query executes")
                .try_collect()
                .await
                .expect("rows stream");
            let old_rows: Vec<JsonValue> = store
                .query(&format!(
                    "MATCH (T:Twin) WHERE {graph}.is_of_model_old(T,'{model}'{exact_argument}) \
                     RETURN T"
                ))
                .await
                .expect("query executes")
                .try_collect()
                .await
                .expect("rows stream");
            assert_eq!(
                dt_ids(&new_rows),
                dt_ids(&old_rows),
                "disagreement for {model} (exact = {exact})"
            );
        }
    }

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn pages_concatenate_to_the_unpaginated_result() {
    let (database, mut store) = seeded().await;
    for index in 0..25 {
        store
            .create_or_replace_twin(
                &format!("moon-{index:02}"),
                json!({ "$metadata": { "$model": "dtmi:com:contoso:Moon;1" } }),
                None,
            )
            .await
            .expect("twin creates");
    }

    let all: Vec<JsonValue> = store
        .query("SELECT * FROM DIGITALTWINS")
        .await
        .expect("query executes")
        .try_collect()
        .await
        .expect("rows stream");

    let mut paged = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let pages: Vec<_> = store
            .query_pages("SELECT * FROM DIGITALTWINS", token.as_deref(), Some(10))
            .take(1)
            .try_collect()
            .await
            .expect("page fetches");
        let page = pages.into_iter().next().expect("one page");
        assert!(page.values.len() <= 10);
        paged.extend(page.values);
        match page.continuation_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    assert_eq!(paged.len(), all.len());
    assert_eq!(dt_ids(&paged), dt_ids(&all));

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn top_limits_the_row_count() {
    let (database, store) = seeded().await;

    let rows: Vec<JsonValue> = store
        .query("SELECT TOP(2) T FROM DIGITALTWINS T")
        .await
        .expect("query executes")
        .try_collect()
        .await
        .expect("rows stream");
    assert_eq!(rows.len(), 2);

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn count_aggregates() {
    let (database, store) = seeded().await;

    let rows: Vec<JsonValue> = store
        .query("SELECT COUNT() FROM DIGITALTWINS")
        .await
        .expect("query executes")
        .try_collect()
        .await
        .expect("rows stream");
    let count = rows[0]
        .as_object()
        .and_then(|row| row.values().next())
        .and_then(JsonValue::as_u64);
    assert_eq!(count, Some(3));

    database.teardown().await;
}
