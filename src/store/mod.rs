//! Persistence sink and the bundled document store backends.
//!
//! [`Sink`] is what the pipeline writes to. It sanitizes every document and
//! then either appends it or upserts it by key, depending on [`SinkMode`].
//! The backends implement [`DocumentStore`]:
//! - [`MemoryStore`] keeps collections in memory (tests, dry runs)
//! - [`JsonLinesStore`] keeps one `<collection>.jsonl` file per collection
//! - [`SurrealStore`] talks to SurrealDB over a connection URL

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::harvest::sanitize::sanitize_in_place;
use crate::model::HarvestRecord;
use crate::traits::{DocumentStore, PersistenceError};

mod surreal;

pub use surreal::{SurrealStore, SurrealStoreBuilder};

/// Field under which stores record the generated document id.
pub const ID_FIELD: &str = "_id";

/// Location selecting [`MemoryStore`].
pub const MEMORY_LOCATION: &str = "memory:";

// ============================================================================
// Sink
// ============================================================================

/// Write discipline of a [`Sink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMode {
    /// Every document is inserted as a new, independent document.
    Append,
    /// Documents are keyed by `key_fields` (dotted paths allowed); a new
    /// document for an existing key overwrites that document's fields.
    Upsert { key_fields: Vec<String> },
}

#[derive(Clone)]
pub struct Sink {
    store: Arc<dyn DocumentStore>,
    collection: String,
    mode: SinkMode,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("collection", &self.collection)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Sink {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>, mode: SinkMode) -> Self {
        Self {
            store,
            collection: collection.into(),
            mode,
        }
    }

    pub fn append(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self::new(store, collection, SinkMode::Append)
    }

    pub fn upsert<K>(store: Arc<dyn DocumentStore>, collection: impl Into<String>, key_fields: K) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let key_fields = key_fields.into_iter().map(Into::into).collect();
        Self::new(store, collection, SinkMode::Upsert { key_fields })
    }

    pub fn mode(&self) -> &SinkMode {
        &self.mode
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Persists one harvest record.
    pub async fn store(&self, record: &HarvestRecord) -> Result<(), PersistenceError> {
        let doc = record.to_document()?;
        self.store_document(doc).await
    }

    /// Persists an arbitrary document under the sink's discipline.
    pub async fn store_document(&self, mut doc: Value) -> Result<(), PersistenceError> {
        sanitize_in_place(&mut doc);
        match &self.mode {
            SinkMode::Append => {
                let id = self.store.insert(&self.collection, doc).await?;
                debug!(collection = %self.collection, id = %id, "Inserted document");
            }
            SinkMode::Upsert { key_fields } => {
                let mut key = Map::new();
                for field in key_fields {
                    let value = lookup_path(&doc, field)
                        .filter(|value| !value.is_null())
                        .ok_or_else(|| PersistenceError::MissingKey(field.clone()))?;
                    key.insert(field.clone(), value.clone());
                }
                self.store.upsert_by_key(&self.collection, key, doc).await?;
                debug!(collection = %self.collection, "Upserted document");
            }
        }
        Ok(())
    }
}

/// Resolves a dotted path such as `result.ip` inside a document.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

fn matches_key(doc: &Value, key: &Map<String, Value>) -> bool {
    key.iter()
        .all(|(field, expected)| lookup_path(doc, field) == Some(expected))
}

/// Overwrites `target`'s top-level fields with those of `update`.
fn merge_fields(target: &mut Value, update: Value) {
    match (target.as_object_mut(), update) {
        (Some(existing), Value::Object(fields)) => {
            for (name, value) in fields {
                if name != ID_FIELD {
                    existing.insert(name, value);
                }
            }
        }
        (_, update) => *target = update,
    }
}

fn with_id(mut doc: Value, id: &str) -> Value {
    if let Value::Object(map) = &mut doc {
        map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }
    doc
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a collection in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .lock()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Simulates an outage: every write fails with `Unavailable` until reset.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn allocate_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, collection: &str, doc: Value) -> Result<String, PersistenceError> {
        self.check_available()?;
        let id = self.allocate_id();
        self.collections
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(with_id(doc, &id));
        Ok(id)
    }

    async fn upsert_by_key(
        &self,
        collection: &str,
        key: Map<String, Value>,
        doc: Value,
    ) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|existing| matches_key(existing, &key)) {
            Some(existing) => merge_fields(existing, doc),
            None => {
                let id = self.allocate_id();
                docs.push(with_id(doc, &id));
            }
        }
        Ok(())
    }
}

// ============================================================================
// JSON-lines backend
// ============================================================================

/// File-backed store: `{root}/{collection}.jsonl`, one document per line.
///
/// Upserts rewrite the collection file through a temp file and rename, so a
/// crash never leaves a half-written collection behind.
#[derive(Debug)]
pub struct JsonLinesStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl JsonLinesStore {
    /// Opens (creating if needed) the store directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|err| PersistenceError::Unavailable(format!("{}: {err}", root.display())))?;
        if !root.is_dir() {
            return Err(PersistenceError::Unavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.jsonl"))
    }

    /// Reads every document of a collection; a missing file is an empty collection.
    pub async fn documents(&self, collection: &str) -> Result<Vec<Value>, PersistenceError> {
        let path = self.collection_path(collection);
        run_blocking(move || read_documents(&path)).await
    }

    fn allocate_id(&self) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{millis:x}-{seq:06x}")
    }
}

#[async_trait]
impl DocumentStore for JsonLinesStore {
    async fn insert(&self, collection: &str, doc: Value) -> Result<String, PersistenceError> {
        let id = self.allocate_id();
        let line = serde_json::to_string(&with_id(doc, &id))?;
        let path = self.collection_path(collection);

        let _guard = self.write_lock.lock().await;
        run_blocking(move || {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{line}")?;
            file.sync_data()?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn upsert_by_key(
        &self,
        collection: &str,
        key: Map<String, Value>,
        doc: Value,
    ) -> Result<(), PersistenceError> {
        let path = self.collection_path(collection);
        let root = self.root.clone();
        let fresh_id = self.allocate_id();

        let _guard = self.write_lock.lock().await;
        run_blocking(move || {
            let mut docs = read_documents(&path)?;
            match docs.iter_mut().find(|existing| matches_key(existing, &key)) {
                Some(existing) => merge_fields(existing, doc),
                None => docs.push(with_id(doc, &fresh_id)),
            }

            let mut tmp = NamedTempFile::new_in(&root)?;
            for doc in &docs {
                writeln!(tmp, "{}", serde_json::to_string(doc)?)?;
            }
            tmp.flush()?;
            tmp.as_file_mut().sync_all()?;
            tmp.persist(&path).map_err(|err| PersistenceError::Io(err.error))?;
            Ok(())
        })
        .await
    }
}

fn read_documents(path: &Path) -> Result<Vec<Value>, PersistenceError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut docs = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        docs.push(serde_json::from_str(&line)?);
    }
    Ok(docs)
}

async fn run_blocking<T, F>(work: F) -> Result<T, PersistenceError>
where
    F: FnOnce() -> Result<T, PersistenceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| PersistenceError::Unavailable(format!("Task join error: {err}")))?
}

// ============================================================================
// Store selection
// ============================================================================

/// Login for stores that need one.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opens the backend named by a store location.
///
/// - `memory:` selects a fresh [`MemoryStore`]
/// - `mem://`, `ws://`, `wss://`, `http://` and `https://` connect a
///   [`SurrealStore`]; `database` selects the database
/// - `file:<dir>` or a bare path selects a [`JsonLinesStore`] under
///   `<dir>/<database>`
///
/// Any other `scheme://` location has no backend and fails with
/// `Unavailable`.
pub async fn open_store(
    location: &str,
    database: &str,
    credentials: Option<&StoreCredentials>,
) -> Result<Arc<dyn DocumentStore>, PersistenceError> {
    if location == MEMORY_LOCATION {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if let Some(dir) = location.strip_prefix("file:") {
        let dir = dir.strip_prefix("//").unwrap_or(dir);
        return Ok(Arc::new(JsonLinesStore::open(Path::new(dir).join(database))?));
    }
    match location.split_once("://") {
        Some((scheme, _)) if SurrealStore::supports(scheme) => {
            let mut builder = SurrealStore::connect(location, database);
            if let Some(login) = credentials {
                builder = builder.credentials(&login.username, &login.password);
            }
            Ok(Arc::new(builder.build().await?))
        }
        Some((scheme, _)) => Err(PersistenceError::Unavailable(format!(
            "no document store backend for '{scheme}://' locations"
        ))),
        None => Ok(Arc::new(JsonLinesStore::open(
            Path::new(location).join(database),
        )?)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_mode_keeps_every_document() {
        let store = Arc::new(MemoryStore::new());
        let sink = Sink::append(store.clone(), "results");
        sink.store_document(json!({"ip": "8.8.8.8", "org": "X"})).await.unwrap();
        sink.store_document(json!({"ip": "8.8.8.8", "org": "Y"})).await.unwrap();

        let docs = store.documents("results").await;
        assert_eq!(docs.len(), 2);
        assert_ne!(docs[0][ID_FIELD], docs[1][ID_FIELD]);
    }

    #[tokio::test]
    async fn upsert_mode_overwrites_by_key() {
        let store = Arc::new(MemoryStore::new());
        let sink = Sink::upsert(store.clone(), "hosts", ["ip"]);
        sink.store_document(json!({"ip": "8.8.8.8", "org": "X", "os": "linux"}))
            .await
            .unwrap();
        sink.store_document(json!({"ip": "8.8.8.8", "org": "Y"})).await.unwrap();
        sink.store_document(json!({"ip": "1.1.1.1", "org": "Z"})).await.unwrap();

        let docs = store.documents("hosts").await;
        assert_eq!(docs.len(), 2);
        let google = docs.iter().find(|d| d["ip"] == "8.8.8.8").unwrap();
        assert_eq!(google["org"], "Y");
        assert_eq!(google["os"], "linux");
    }

    #[tokio::test]
    async fn upsert_without_key_is_rejected() {
        let sink = Sink::upsert(Arc::new(MemoryStore::new()), "hosts", ["ip"]);
        let err = sink.store_document(json!({"org": "X"})).await.unwrap_err();
        assert!(matches!(err, PersistenceError::MissingKey(field) if field == "ip"));
    }

    #[tokio::test]
    async fn upsert_key_may_be_nested() {
        let store = Arc::new(MemoryStore::new());
        let sink = Sink::upsert(store.clone(), "records", ["endpoint", "params.ip"]);
        sink.store_document(json!({"endpoint": "host", "params": {"ip": "1"}, "v": 1}))
            .await
            .unwrap();
        sink.store_document(json!({"endpoint": "host", "params": {"ip": "1"}, "v": 2}))
            .await
            .unwrap();
        let docs = store.documents("records").await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["v"], 2);
    }

    #[tokio::test]
    async fn sink_sanitizes_before_writing() {
        let store = Arc::new(MemoryStore::new());
        let sink = Sink::append(store.clone(), "results");
        let doc: Value = serde_json::from_str(r#"{"n": 18446744073709551616}"#).unwrap();
        sink.store_document(doc).await.unwrap();
        assert_eq!(store.documents("results").await[0]["n"], "18446744073709551616");
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let sink = Sink::append(store.clone(), "results");
        let err = sink.store_document(json!({})).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable(_)));
        store.set_available(true);
        sink.store_document(json!({})).await.unwrap();
    }

    #[test]
    fn lookup_path_walks_objects() {
        let doc = json!({"a": {"b": {"c": 3}}});
        assert_eq!(lookup_path(&doc, "a.b.c"), Some(&json!(3)));
        assert_eq!(lookup_path(&doc, "a.x"), None);
    }

    #[tokio::test]
    async fn open_store_selects_backend() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(open_store(MEMORY_LOCATION, "db", None).await.is_ok());

        let location = temp.path().to_str().unwrap();
        open_store(location, "shodan_db", None).await.unwrap();
        assert!(temp.path().join("shodan_db").is_dir());

        open_store(&format!("file:{location}"), "mitre_attack", None)
            .await
            .unwrap();
        assert!(temp.path().join("mitre_attack").is_dir());

        let surreal = open_store("mem://", "shodan_db", None).await.unwrap();
        surreal.insert("results", json!({"ok": true})).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_scheme_is_unavailable() {
        let err = open_store("mongodb://db.example.invalid:27017", "shodan_db", None)
            .await
            .err().unwrap();
        assert!(matches!(err, PersistenceError::Unavailable(ref reason) if reason.contains("mongodb")));
        assert!(!Path::new("harvest-data/shodan_db").exists());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let login = StoreCredentials {
            username: "root".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{login:?}").contains("hunter2"));
    }
}
