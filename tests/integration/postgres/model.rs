use serde_json::{Value as JsonValue, json};
use twin_graph::store::{GetModelOptions, ListModelsOptions, ModelStore as _, error};
use twin_types::Dtmi;

use crate::DatabaseTestWrapper;

fn dtmi(value: &str) -> Dtmi {
    value.parse().expect("valid DTMI")
}

pub fn celestial_body() -> JsonValue {
    json!({
        "@id": "dtmi:com:contoso:CelestialBody;1",
        "@type": "Interface",
        "@context": "dtmi:dtdl:context;3",
        "displayName": "Celestial body",
        "contents": [
            { "@type": "Property", "name": "name", "schema": "string" },
            { "@type": "Property", "name": "mass", "schema": "double" }
        ]
    })
}

pub fn planet() -> JsonValue {
    json!({
        "@id": "dtmi:com:contoso:Planet;1",
        "@type": "Interface",
        "@context": "dtmi:dtdl:context;3",
        "extends": "dtmi:com:contoso:CelestialBody;1",
        "contents": [
            {
                "@type": "Relationship",
                "name": "satellites",
                "target": "dtmi:com:contoso:Moon;1"
            },
            {
                "@type": "Component",
                "name": "deepestCrater",
                "schema": "dtmi:com:contoso:Crater;1"
            }
        ]
    })
}

pub fn habitable_planet() -> JsonValue {
    json!({
        "@id": "dtmi:com:contoso:HabitablePlanet;1",
        "@type": "Interface",
        "@context": "dtmi:dtdl:context;3",
        "extends": "dtmi:com:contoso:Planet;1",
        "contents": [
            { "@type": "Property", "name": "hasLife", "schema": "boolean" }
        ]
    })
}

pub fn moon() -> JsonValue {
    json!({
        "@id": "dtmi:com:contoso:Moon;1",
        "@type": "Interface",
        "@context": "dtmi:dtdl:context;3",
        "contents": []
    })
}

pub fn crater() -> JsonValue {
    json!({
        "@id": "dtmi:com:contoso:Crater;1",
        "@type": "Interface",
        "@context": "dtmi:dtdl:context;3",
        "contents": [
            { "@type": "Property", "name": "diameter", "schema": "double" }
        ]
    })
}

pub fn solar_system() -> Vec<JsonValue> {
    vec![celestial_body(), planet(), habitable_planet(), moon(), crater()]
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn bases_and_descendants_are_mutual_inverses() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;

    let records = store
        .create_models(&solar_system())
        .await
        .expect("model batch creates");
    assert_eq!(records.len(), 5);

    let habitable = store
        .get_model(&dtmi("dtmi:com:contoso:HabitablePlanet;1"), GetModelOptions::default())
        .await
        .expect("model exists");
    assert_eq!(
        habitable.bases,
        vec![
            dtmi("dtmi:com:contoso:Planet;1"),
            dtmi("dtmi:com:contoso:CelestialBody;1"),
        ]
    );

    for base in &habitable.bases {
        let ancestor = store
            .get_model(base, GetModelOptions::default())
            .await
            .expect("ancestor exists");
        assert!(
            ancestor.descendants.contains(&habitable.id),
            "{} must list {} as a descendant",
            ancestor.id,
            habitable.id
        );
    }

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn unresolved_references_fail_the_whole_batch() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;

    let report = store
        .create_models(&[planet()])
        .await
        .expect_err("moon and crater are unresolved");
    assert!(report.contains::<error::ResolutionError>());

    // all-or-nothing: nothing from the failed batch may exist
    let listed = store
        .list_models(ListModelsOptions::default())
        .await
        .expect("listing succeeds");
    assert!(listed.is_empty());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn creating_a_live_duplicate_is_a_conflict() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;

    store
        .create_models(&[celestial_body()])
        .await
        .expect("first create succeeds");
    let report = store
        .create_models(&[celestial_body()])
        .await
        .expect_err("duplicate is rejected");
    assert!(report.contains::<error::ModelAlreadyExists>());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn replace_guards_identity_extends_and_descendant_names() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_models(&solar_system())
        .await
        .expect("model batch creates");

    // changed extends set
    let mut detached = celestial_body();
    detached["extends"] = json!("dtmi:com:contoso:Moon;1");
    let report = store
        .replace_model(&dtmi("dtmi:com:contoso:CelestialBody;1"), &detached)
        .await
        .expect_err("extends is immutable across replace");
    assert!(report.contains::<error::ModelExtendsChanged>());

    // new content name collides with HabitablePlanet's own `hasLife`
    let mut colliding = celestial_body();
    colliding["contents"]
        .as_array_mut()
        .expect("contents is an array")
        .push(json!({ "@type": "Property", "name": "hasLife", "schema": "string" }));
    let report = store
        .replace_model(&dtmi("dtmi:com:contoso:CelestialBody;1"), &colliding)
        .await
        .expect_err("descendant name collisions are rejected");
    assert!(report.contains::<error::ModelUpdateValidationError>());

    // a compatible replace keeps bases intact
    let mut renamed = celestial_body();
    renamed["displayName"] = json!("Celestial body (revised)");
    let replaced = store
        .replace_model(&dtmi("dtmi:com:contoso:CelestialBody;1"), &renamed)
        .await
        .expect("compatible replace succeeds");
    assert!(replaced.bases.is_empty());

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn referenced_models_cannot_be_deleted() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_models(&solar_system())
        .await
        .expect("model batch creates");

    let report = store
        .delete_model(&dtmi("dtmi:com:contoso:CelestialBody;1"))
        .await
        .expect_err("extended models cannot be deleted");
    assert!(report.contains::<error::ModelReferencesNotDeleted>());

    let report = store
        .delete_model(&dtmi("dtmi:com:contoso:Crater;1"))
        .await
        .expect_err("component schemas cannot be deleted");
    assert!(report.contains::<error::ModelReferencesNotDeleted>());

    // leaves can go, then their parents
    store
        .delete_model(&dtmi("dtmi:com:contoso:HabitablePlanet;1"))
        .await
        .expect("leaf deletes");
    let celestial = store
        .get_model(&dtmi("dtmi:com:contoso:CelestialBody;1"), GetModelOptions::default())
        .await
        .expect("model exists");
    assert!(
        !celestial
            .descendants
            .contains(&dtmi("dtmi:com:contoso:HabitablePlanet;1")),
        "deleted model must leave every ancestor's descendants"
    );

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn delete_then_recreate_restores_identical_bases() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_models(&solar_system())
        .await
        .expect("model batch creates");

    let before = store
        .get_model(&dtmi("dtmi:com:contoso:HabitablePlanet;1"), GetModelOptions::default())
        .await
        .expect("model exists");
    store
        .delete_model(&dtmi("dtmi:com:contoso:HabitablePlanet;1"))
        .await
        .expect("leaf deletes");
    store
        .create_models(&[habitable_planet()])
        .await
        .expect("recreate succeeds");
    let after = store
        .get_model(&dtmi("dtmi:com:contoso:HabitablePlanet;1"), GetModelOptions::default())
        .await
        .expect("model exists");

    assert_eq!(before.bases, after.bases);
    assert_eq!(before.decommissioned, after.decommissioned);

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn flattened_contents_merge_over_bases() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_models(&solar_system())
        .await
        .expect("model batch creates");

    let record = store
        .get_model(
            &dtmi("dtmi:com:contoso:HabitablePlanet;1"),
            GetModelOptions { include_base_model_contents: true },
        )
        .await
        .expect("model exists");
    let contents = record.contents.expect("flattened contents requested");
    let names: Vec<_> = contents
        .iter()
        .filter_map(|content| content.get("name").and_then(JsonValue::as_str))
        .collect();
    for expected in ["name", "mass", "satellites", "deepestCrater", "hasLife"] {
        assert!(names.contains(&expected), "missing `{expected}` in {names:?}");
    }

    database.teardown().await;
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server with the AGE extension"]
async fn decommission_round_trip() {
    let database = DatabaseTestWrapper::new().await;
    let mut store = database.store().await;
    store
        .create_models(&[celestial_body()])
        .await
        .expect("model creates");

    store
        .update_model(&dtmi("dtmi:com:contoso:CelestialBody;1"), true)
        .await
        .expect("decommission succeeds");
    let record = store
        .get_model(&dtmi("dtmi:com:contoso:CelestialBody;1"), GetModelOptions::default())
        .await
        .expect("model exists");
    assert!(record.decommissioned);

    let report = store
        .update_model(&dtmi("dtmi:com:contoso:Missing;1"), true)
        .await
        .expect_err("missing models cannot be decommissioned");
    assert!(report.contains::<error::ModelNotFound>());

    database.teardown().await;
}
