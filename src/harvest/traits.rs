//! Core traits and types shared by every harvest stage.
//!
//! - Stage invocation via [`Invoke`]
//! - Run-scoped identifier threading via [`DependencyState`]
//! - Declarative identifier extraction via [`ExtractionPolicy`]
//! - Per-stage failure via [`StageError`]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::traits::HttpError;

// ============================================================================
// Dependency State
// ============================================================================

/// Name of a slot in [`DependencyState`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(String);

impl StateKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifiers discovered by earlier stages, visible to later ones.
///
/// One instance belongs to exactly one run. It is created empty, written
/// only by stages that declare a production and read by stages that declare
/// a consumption.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyState {
    values: HashMap<StateKey, Value>,
}

impl DependencyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: StateKey, value: Value) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &StateKey) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        self.values.contains_key(key)
    }

    /// Scalar rendering of a slot, suitable for a path segment or query value.
    pub fn get_text(&self, key: &StateKey) -> Option<String> {
        self.get(key).and_then(value_as_text)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub(crate) fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// Extraction Policy
// ============================================================================

/// How a producer stage locates the identifier it publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionPolicy {
    /// Take the first element of the first non-empty list among
    /// `collections` (or the payload itself when `collections` is empty)
    /// and return its first non-empty field among `fields`.
    FirstId {
        collections: Vec<String>,
        fields: Vec<String>,
    },
    /// Collect `field` from the first `limit` elements of the list stored
    /// under `collection` (or of the payload itself when it is a list).
    Ids {
        collection: Option<String>,
        field: String,
        limit: usize,
    },
    /// Publish the value stored under `field` as is.
    Field(String),
}

impl ExtractionPolicy {
    pub fn first_id<C, F>(collections: C, fields: F) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self::FirstId {
            collections: collections.into_iter().map(Into::into).collect(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn ids(collection: Option<&str>, field: &str, limit: usize) -> Self {
        Self::Ids {
            collection: collection.map(str::to_string),
            field: field.to_string(),
            limit,
        }
    }

    /// Returns the identifier found in `payload`, if any. Absence is a
    /// normal outcome.
    pub fn extract(&self, payload: &Value) -> Option<Value> {
        match self {
            Self::FirstId {
                collections,
                fields,
            } => {
                let candidate = if collections.is_empty() {
                    payload
                } else {
                    collections
                        .iter()
                        .filter_map(|name| payload.get(name))
                        .find(|items| is_truthy(items))?
                        .as_array()?
                        .first()?
                };
                fields
                    .iter()
                    .filter_map(|field| candidate.get(field))
                    .find(|value| is_truthy(value))
                    .cloned()
            }
            Self::Ids {
                collection,
                field,
                limit,
            } => {
                let items = match collection {
                    Some(name) => payload.get(name)?.as_array()?,
                    None => payload.as_array()?,
                };
                let ids: Vec<Value> = items
                    .iter()
                    .take(*limit)
                    .filter_map(|item| item.get(field))
                    .filter(|value| is_truthy(value))
                    .cloned()
                    .collect();
                if ids.is_empty() {
                    None
                } else {
                    Some(Value::Array(ids))
                }
            }
            Self::Field(field) => payload.get(field).filter(|value| is_truthy(value)).cloned(),
        }
    }
}

/// Emptiness in the loose sense used for identifier candidates:
/// null, false, zero, empty strings and empty containers do not count.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ============================================================================
// Stage Invocation
// ============================================================================

/// Errors that fail a single stage. The run itself continues.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Stage execution exceeded timeout
    #[error("Stage '{stage}' timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },

    #[error("{0}")]
    Failed(String),
}

/// The unit of work behind a stage.
///
/// Implementations read whatever earlier identifiers they need from the
/// supplied state and never hold references to other stages.
#[async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, state: &DependencyState) -> Result<Value, StageError>;
}

/// Adapts an async closure into an [`Invoke`]. The closure receives a
/// snapshot of the state.
pub struct FnInvoke<F>(pub F);

#[async_trait]
impl<F, Fut> Invoke for FnInvoke<F>
where
    F: Fn(DependencyState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StageError>> + Send + 'static,
{
    async fn invoke(&self, state: &DependencyState) -> Result<Value, StageError> {
        (self.0)(state.clone()).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scan_policy() -> ExtractionPolicy {
        ExtractionPolicy::first_id(
            ["scans", "matches", "data", "results"],
            ["id", "scan_id", "query"],
        )
    }

    #[test]
    fn first_id_prefers_earlier_fields() {
        let payload = json!({"matches": [{"scan_id": "s-2", "id": "s-1"}]});
        assert_eq!(scan_policy().extract(&payload), Some(json!("s-1")));
    }

    #[test]
    fn first_id_skips_empty_collections_and_fields() {
        let payload = json!({
            "scans": [],
            "data": [{"id": "", "scan_id": null, "query": "port:22"}],
        });
        assert_eq!(scan_policy().extract(&payload), Some(json!("port:22")));
    }

    #[test]
    fn first_id_absent_is_none() {
        assert_eq!(scan_policy().extract(&json!({"total": 0})), None);
        assert_eq!(scan_policy().extract(&json!({"scans": [{"status": "DONE"}]})), None);
        assert_eq!(scan_policy().extract(&json!("not an object")), None);
    }

    #[test]
    fn first_id_without_collections_reads_payload() {
        let policy = ExtractionPolicy::first_id(Vec::<String>::new(), ["id", "scan_id"]);
        let payload = json!({"id": "NEW", "count": 1, "credits_left": 99});
        assert_eq!(policy.extract(&payload), Some(json!("NEW")));
    }

    #[test]
    fn ids_respects_limit() {
        let policy = ExtractionPolicy::ids(Some("collections"), "id", 2);
        let payload = json!({"collections": [{"id": "a"}, {"id": "b"}, {"id": "c"}]});
        assert_eq!(policy.extract(&payload), Some(json!(["a", "b"])));
        assert_eq!(policy.extract(&json!({"collections": []})), None);
    }

    #[test]
    fn field_policy_copies_value() {
        let policy = ExtractionPolicy::Field("refs".into());
        let payload = json!({"refs": [{"a": 1}], "empty": []});
        assert_eq!(policy.extract(&payload), Some(json!([{"a": 1}])));
        assert_eq!(ExtractionPolicy::Field("empty".into()).extract(&payload), None);
    }

    #[test]
    fn state_get_text_renders_scalars() {
        let mut state = DependencyState::new();
        state.set("n".into(), json!(42));
        state.set("s".into(), json!("abc"));
        state.set("empty".into(), json!(""));
        assert_eq!(state.get_text(&"n".into()).as_deref(), Some("42"));
        assert_eq!(state.get_text(&"s".into()).as_deref(), Some("abc"));
        assert_eq!(state.get_text(&"empty".into()), None);
        assert_eq!(state.get_text(&"missing".into()), None);
        assert_eq!(state.len(), 3);
    }

    #[tokio::test]
    async fn fn_invoke_sees_state_snapshot() {
        let invoke = FnInvoke(|state: DependencyState| async move {
            Ok::<_, StageError>(json!({"seen": state.get(&"k".into()).cloned()}))
        });
        let mut state = DependencyState::new();
        state.set("k".into(), json!("v"));
        let out = invoke.invoke(&state).await.unwrap();
        assert_eq!(out, json!({"seen": "v"}));
    }
}
