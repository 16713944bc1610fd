use std::fs;
use std::sync::Arc;

use api_harvester::store::ID_FIELD;
use api_harvester::{
    open_store, DependencyState, DocumentStore, HarvestPipeline, HarvestRecord, JsonLinesStore,
    PersistenceError, Sink, SinkMode, Stage, StageError, StageRegistry, SurrealStore,
};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

#[tokio::test]
async fn insert_appends_lines_with_ids() {
    let temp = TempDir::new().unwrap();
    let store = JsonLinesStore::open(temp.path().join("db")).unwrap();

    let first = store.insert("results", json!({"endpoint": "a"})).await.unwrap();
    let second = store.insert("results", json!({"endpoint": "b"})).await.unwrap();
    assert_ne!(first, second);

    let raw = fs::read_to_string(store.collection_path("results")).unwrap();
    assert_eq!(raw.lines().count(), 2);

    let docs = store.documents("results").await.unwrap();
    assert_eq!(docs[0]["endpoint"], "a");
    assert_eq!(docs[1][ID_FIELD], second.as_str());
}

#[tokio::test]
async fn upsert_rewrites_matching_document() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonLinesStore::open(temp.path()).unwrap());
    let sink = Sink::upsert(store.clone(), "hosts", ["ip"]);

    sink.store_document(json!({"ip": "8.8.8.8", "org": "X"})).await.unwrap();
    sink.store_document(json!({"ip": "8.8.8.8", "org": "Y"})).await.unwrap();

    let docs = store.documents("hosts").await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["org"], "Y");
    assert!(docs[0].get(ID_FIELD).is_some());
}

#[tokio::test]
async fn missing_collection_reads_empty() {
    let temp = TempDir::new().unwrap();
    let store = JsonLinesStore::open(temp.path()).unwrap();
    assert!(store.documents("nothing").await.unwrap().is_empty());
}

#[tokio::test]
async fn records_are_sanitized_on_disk() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonLinesStore::open(temp.path()).unwrap());
    let sink = Sink::append(store.clone(), "results");
    assert_eq!(sink.mode(), &SinkMode::Append);

    let result: Value = serde_json::from_str(r#"{"id": 340282366920938463463374607431768211456}"#).unwrap();
    let record = HarvestRecord::success("scans", Map::new(), result);
    sink.store(&record).await.unwrap();

    let raw = fs::read_to_string(store.collection_path("results")).unwrap();
    assert!(raw.contains(r#""id":"340282366920938463463374607431768211456""#));
}

#[test]
fn open_fails_when_root_is_a_file() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("occupied");
    fs::write(&file, "x").unwrap();
    let err = JsonLinesStore::open(&file).unwrap_err();
    assert!(matches!(err, PersistenceError::Unavailable(_)));
}

#[tokio::test]
async fn upsert_key_lookup_does_not_match_other_keys() {
    let temp = TempDir::new().unwrap();
    let store = JsonLinesStore::open(temp.path()).unwrap();
    let mut key = Map::new();
    key.insert("ip".into(), json!("1.1.1.1"));
    store
        .upsert_by_key("hosts", key.clone(), json!({"ip": "1.1.1.1", "v": 1}))
        .await
        .unwrap();
    let mut other = Map::new();
    other.insert("ip".into(), json!("9.9.9.9"));
    store
        .upsert_by_key("hosts", other, json!({"ip": "9.9.9.9", "v": 1}))
        .await
        .unwrap();
    store
        .upsert_by_key("hosts", key, json!({"ip": "1.1.1.1", "v": 2}))
        .await
        .unwrap();

    let docs = store.documents("hosts").await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["v"], 2);
    assert_eq!(docs[1]["v"], 1);
}

#[tokio::test]
async fn database_locations_without_a_backend_fail() {
    for location in ["mongodb://db.example.invalid:27017", "redis://localhost:6379"] {
        let err = open_store(location, "shodan_db", None).await.err().unwrap();
        assert!(
            matches!(err, PersistenceError::Unavailable(_)),
            "{location} gave {err}"
        );
    }
}

#[tokio::test]
async fn pipeline_persists_into_surrealdb() {
    let store = Arc::new(SurrealStore::memory("shodan_db").await.unwrap());
    let sink = Sink::append(store.clone(), "shodan_results");
    let registry = StageRegistry::new()
        .with(Stage::from_fn("api_info", |_| async {
            serde_json::from_str::<Value>(r#"{"credits": 18446744073709551616, "plan": "dev"}"#)
                .map_err(|err| StageError::Failed(err.to_string()))
        }))
        .unwrap()
        .with(Stage::from_fn("ports", |_| async {
            Err::<Value, _>(StageError::Failed("503 Service Unavailable".into()))
        }))
        .unwrap();

    let summary = HarvestPipeline::new()
        .execute(&registry, &mut DependencyState::new(), &sink)
        .await
        .unwrap();
    assert_eq!(summary.persistence_failures, 0);

    let docs = store.documents("shodan_results").await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["endpoint"], "api_info");
    assert_eq!(docs[0]["result"]["credits"], "18446744073709551616");
    assert_eq!(docs[1]["error"], "503 Service Unavailable");
}

#[tokio::test]
async fn surreal_upsert_keeps_one_document_per_ip() {
    let store = Arc::new(SurrealStore::memory("shodan_db").await.unwrap());
    let sink = Sink::upsert(store.clone(), "hosts", ["ip"]);
    for org in ["X", "Y"] {
        sink.store_document(json!({"ip": "8.8.8.8", "org": org})).await.unwrap();
    }

    let docs = store.documents("hosts").await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["org"], "Y");
}
