//! SurrealDB backend, addressed by connection URL.
//!
//! Supported locations:
//! - In-memory: `mem://` (tests, dry runs)
//! - Remote: `ws://host:port`, `wss://host:port`, `http(s)://host:port`
//!
//! Every collection is a table. A row keeps the document twice: `body` as a
//! structured object that upsert keys are matched against, and `doc_json` as
//! the exact JSON text that is read back.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use surrealdb::engine::any::{connect, Any};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{merge_fields, with_id};
use crate::harvest::sanitize::is_sanitized;
use crate::traits::{DocumentStore, PersistenceError};

pub const NAMESPACE: &str = "harvester";

/// URL schemes served by [`SurrealStore`].
pub const SCHEMES: &[&str] = &["mem", "ws", "wss", "http", "https"];

pub struct SurrealStore {
    db: Surreal<Any>,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SurrealStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealStore").finish_non_exhaustive()
    }
}

/// Builder for a [`SurrealStore`] connection.
pub struct SurrealStoreBuilder {
    url: String,
    username: Option<String>,
    password: Option<String>,
    namespace: String,
    database: String,
}

impl SurrealStoreBuilder {
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Connects, signs in when credentials are set and selects the database.
    pub async fn build(self) -> Result<SurrealStore, PersistenceError> {
        let db: Surreal<Any> = connect(&self.url)
            .await
            .map_err(|e| unavailable("SurrealDB connect failed", e))?;

        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            db.signin(Root {
                username: user,
                password: pass,
            })
            .await
            .map_err(|e| unavailable("SurrealDB auth failed", e))?;
        }

        db.use_ns(&self.namespace)
            .use_db(&self.database)
            .await
            .map_err(|e| unavailable("SurrealDB use ns/db failed", e))?;

        info!(url = %self.url, namespace = %self.namespace, database = %self.database, "Connected to SurrealDB");
        Ok(SurrealStore {
            db,
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StoredRow {
    doc_key: String,
    doc_json: String,
}

impl SurrealStore {
    pub fn connect(url: impl Into<String>, database: impl Into<String>) -> SurrealStoreBuilder {
        SurrealStoreBuilder {
            url: url.into(),
            username: None,
            password: None,
            namespace: NAMESPACE.to_string(),
            database: database.into(),
        }
    }

    /// Fresh in-memory instance.
    pub async fn memory(database: &str) -> Result<Self, PersistenceError> {
        Self::connect("mem://", database).build().await
    }

    pub fn supports(scheme: &str) -> bool {
        SCHEMES.contains(&scheme)
    }

    /// Every document of a collection in insertion order.
    pub async fn documents(&self, collection: &str) -> Result<Vec<Value>, PersistenceError> {
        let mut response = self
            .db
            .query("SELECT doc_key, doc_json FROM type::table($table) ORDER BY doc_key")
            .bind(("table", collection.to_string()))
            .await
            .map_err(|e| rejected("Failed to list documents", e))?;
        let rows: Vec<StoredRow> = response
            .take(0)
            .map_err(|e| rejected("Failed to parse documents", e))?;
        rows.iter()
            .map(|row| serde_json::from_str(&row.doc_json).map_err(PersistenceError::from))
            .collect()
    }

    /// Millisecond clock, process id, then a per-store sequence.
    fn allocate_key(&self) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{millis:012x}{:08x}{seq:08x}", std::process::id())
    }

    async fn write_row(&self, collection: &str, key: &str, doc: Value) -> Result<(), PersistenceError> {
        let raw = serde_json::to_string(&doc)?;
        self.db
            .query("UPSERT type::thing($table, $key) SET doc_key = $key, body = $body, doc_json = $raw")
            .bind(("table", collection.to_string()))
            .bind(("key", key.to_string()))
            .bind(("body", PlainJson(doc)))
            .bind(("raw", raw))
            .await
            .and_then(|response| response.check())
            .map_err(|e| rejected("Failed to write document", e))?;
        Ok(())
    }

    async fn find_by_key(
        &self,
        collection: &str,
        key: &Map<String, Value>,
    ) -> Result<Option<StoredRow>, PersistenceError> {
        let mut conditions = Vec::with_capacity(key.len());
        for (index, field) in key.keys().enumerate() {
            conditions.push(format!("body.{} = $k{index}", field_path(field)?));
        }
        let sql = format!(
            "SELECT doc_key, doc_json FROM type::table($table) WHERE {} ORDER BY doc_key LIMIT 1",
            conditions.join(" AND ")
        );

        let mut query = self.db.query(sql).bind(("table", collection.to_string()));
        for (index, value) in key.values().enumerate() {
            query = query.bind((format!("k{index}"), PlainJson(value.clone())));
        }
        let mut response = query
            .await
            .map_err(|e| rejected("Failed to look up document", e))?;
        let rows: Vec<StoredRow> = response
            .take(0)
            .map_err(|e| rejected("Failed to parse document", e))?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl DocumentStore for SurrealStore {
    async fn insert(&self, collection: &str, doc: Value) -> Result<String, PersistenceError> {
        ensure_sanitized(&doc)?;
        let key = self.allocate_key();
        self.write_row(collection, &key, with_id(doc, &key)).await?;
        debug!(collection, key = %key, "Created SurrealDB record");
        Ok(key)
    }

    async fn upsert_by_key(
        &self,
        collection: &str,
        key: Map<String, Value>,
        doc: Value,
    ) -> Result<(), PersistenceError> {
        ensure_sanitized(&doc)?;
        if key.is_empty() {
            return Err(PersistenceError::Rejected("upsert key is empty".into()));
        }

        let _guard = self.write_lock.lock().await;
        match self.find_by_key(collection, &key).await? {
            Some(row) => {
                let mut existing: Value = serde_json::from_str(&row.doc_json)?;
                merge_fields(&mut existing, doc);
                self.write_row(collection, &row.doc_key, existing).await
            }
            None => {
                let fresh = self.allocate_key();
                self.write_row(collection, &fresh, with_id(doc, &fresh)).await
            }
        }
    }
}

fn ensure_sanitized(doc: &Value) -> Result<(), PersistenceError> {
    if is_sanitized(doc) {
        Ok(())
    } else {
        Err(PersistenceError::Rejected(
            "document holds integers outside the signed 64-bit range".into(),
        ))
    }
}

/// Validates a dotted key path before it is spliced into a query.
fn field_path(path: &str) -> Result<&str, PersistenceError> {
    let valid = path.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    if valid {
        Ok(path)
    } else {
        Err(PersistenceError::Rejected(format!(
            "unsupported key field '{path}'"
        )))
    }
}

fn unavailable(context: &str, err: surrealdb::Error) -> PersistenceError {
    PersistenceError::Unavailable(format!("{context}: {err}"))
}

fn rejected(context: &str, err: surrealdb::Error) -> PersistenceError {
    PersistenceError::Rejected(format!("{context}: {err}"))
}

/// A document serialized with native number types.
///
/// `serde_json` built with `arbitrary_precision` serializes numbers as a
/// private wrapper struct, which other serializers would store verbatim.
struct PlainJson(Value);

impl Serialize for PlainJson {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PlainRef(&self.0).serialize(serializer)
    }
}

struct PlainRef<'a>(&'a Value);

impl Serialize for PlainRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    serializer.serialize_i64(i)
                } else if let Some(f) = n.as_f64() {
                    serializer.serialize_f64(f)
                } else {
                    serializer.serialize_str(&n.to_string())
                }
            }
            Value::String(text) => serializer.serialize_str(text),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&PlainRef(item))?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (name, value) in map {
                    out.serialize_entry(name, &PlainRef(value))?;
                }
                out.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Sink, ID_FIELD};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn insert_then_read_back_in_order() {
        let store = SurrealStore::memory("shodan_db").await.unwrap();
        let first = store.insert("results", json!({"endpoint": "a", "n": 1})).await.unwrap();
        store.insert("results", json!({"endpoint": "b", "n": 2.5})).await.unwrap();

        let docs = store.documents("results").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["endpoint"], "a");
        assert_eq!(docs[0][ID_FIELD], first.as_str());
        assert_eq!(docs[1]["n"], 2.5);
    }

    #[tokio::test]
    async fn upsert_matches_on_nested_key() {
        let store = Arc::new(SurrealStore::memory("shodan_db").await.unwrap());
        let sink = Sink::upsert(store.clone(), "hosts", ["ip", "geo.country"]);
        sink.store_document(json!({"ip": "8.8.8.8", "geo": {"country": "US"}, "org": "X", "os": "linux"}))
            .await
            .unwrap();
        sink.store_document(json!({"ip": "8.8.8.8", "geo": {"country": "US"}, "org": "Y"}))
            .await
            .unwrap();
        sink.store_document(json!({"ip": "8.8.8.8", "geo": {"country": "DE"}, "org": "Z"}))
            .await
            .unwrap();

        let docs = store.documents("hosts").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["org"], "Y");
        assert_eq!(docs[0]["os"], "linux");
        assert_eq!(docs[1]["org"], "Z");
    }

    #[tokio::test]
    async fn oversized_integers_are_refused_unsanitized() {
        let store = SurrealStore::memory("db").await.unwrap();
        let doc: Value = serde_json::from_str(r#"{"n": 18446744073709551616}"#).unwrap();
        let err = store.insert("results", doc).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Rejected(_)));
    }

    #[tokio::test]
    async fn odd_key_fields_are_rejected() {
        let store = SurrealStore::memory("db").await.unwrap();
        let mut key = Map::new();
        key.insert("ip; DELETE hosts".into(), json!("x"));
        let err = store
            .upsert_by_key("hosts", key, json!({"ip": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Rejected(_)));
    }

    #[test]
    fn plain_json_drops_number_wrapper() {
        let doc: Value = serde_json::from_str(r#"{"a": [1, -2, 0.5]}"#).unwrap();
        let text = serde_json::to_string(&PlainJson(doc)).unwrap();
        assert_eq!(text, r#"{"a":[1,-2,0.5]}"#);
    }
}
