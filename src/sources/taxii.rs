//! MITRE ATT&CK TAXII 2.1 collections fan-out.
//!
//! collections → manifest → objects → versions. Each level reads the ids
//! published by the previous one from the dependency state. Every level is
//! truncated to a small fixed depth; the harvest is a sample, not a mirror.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::client::{ClientSettings, RateLimitedClient};
use crate::harvest::{
    DependencyState, ExtractionPolicy, Invoke, PipelineError, Request, Stage, StageError,
    StageRegistry, StateKey,
};
use crate::traits::{ApiCaller, ApiRequest, HttpError};

pub const BASE_URL: &str = "https://attack-taxii.mitre.org/api/v21";
pub const ACCEPT: &str = "application/taxii+json;version=2.1";

pub const COLLECTION_IDS: &str = "collection_ids";
pub const OBJECT_REFS: &str = "object_refs";

/// Items kept at every level of the fan-out.
pub const SAMPLE_DEPTH: usize = 3;

pub fn client(min_interval: Duration, base_url: Option<&str>) -> Result<RateLimitedClient, HttpError> {
    let settings = ClientSettings::new(base_url.unwrap_or(BASE_URL))
        .with_header("Accept", ACCEPT)
        .with_min_interval(min_interval);
    RateLimitedClient::new(settings)
}

pub fn collection_registry(caller: Arc<dyn ApiCaller>) -> Result<StageRegistry, PipelineError> {
    StageRegistry::new()
        .with(
            Stage::request("collections", Request::get(caller.clone(), "/collections"))
                .produces(
                    COLLECTION_IDS,
                    ExtractionPolicy::ids(Some("collections"), "id", SAMPLE_DEPTH),
                ),
        )?
        .with(
            Stage::new("manifest", Manifests { caller: caller.clone() })
                .consumes(COLLECTION_IDS)
                .params(json!({"limit": SAMPLE_DEPTH})),
        )?
        .with(
            Stage::new("objects", Objects { caller: caller.clone() })
                .consumes(COLLECTION_IDS)
                .produces(OBJECT_REFS, ExtractionPolicy::Field(OBJECT_REFS.into()))
                .params(json!({"limit": SAMPLE_DEPTH, "x_mitre_contents_limit": SAMPLE_DEPTH})),
        )?
        .with(Stage::new("versions", Versions { caller }).consumes(OBJECT_REFS))
}

fn collection_ids(state: &DependencyState) -> Option<Vec<String>> {
    let ids: Vec<String> = state
        .get(&StateKey::new(COLLECTION_IDS))?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    (!ids.is_empty()).then_some(ids)
}

fn truncated(list: Option<&Value>, depth: usize) -> Vec<Value> {
    list.and_then(Value::as_array)
        .map(|items| items.iter().take(depth).cloned().collect())
        .unwrap_or_default()
}

/// Collects per-item results of one fan-out level.
///
/// The level fails only when every sub-call failed.
#[derive(Default)]
struct FanOut {
    entries: Vec<Value>,
    errors: Vec<Value>,
}

impl FanOut {
    fn failed(&mut self, context: Value, err: HttpError) {
        warn!(context = %context, error = %err, "TAXII sub-request failed");
        self.errors.push(json!({"context": context, "error": err.to_string()}));
    }

    fn finish(self, mut payload: serde_json::Map<String, Value>) -> Result<Value, StageError> {
        if self.entries.is_empty() && !self.errors.is_empty() {
            let reasons: Vec<String> = self
                .errors
                .iter()
                .filter_map(|e| e.get("error").and_then(Value::as_str).map(str::to_string))
                .collect();
            return Err(StageError::Failed(reasons.join("; ")));
        }
        payload.insert("entries".into(), Value::Array(self.entries));
        payload.insert("errors".into(), Value::Array(self.errors));
        Ok(Value::Object(payload))
    }
}

fn missing(key: &str) -> Value {
    json!({"note": format!("no_{key}_available")})
}

struct Manifests {
    caller: Arc<dyn ApiCaller>,
}

#[async_trait]
impl Invoke for Manifests {
    async fn invoke(&self, state: &DependencyState) -> Result<Value, StageError> {
        let Some(ids) = collection_ids(state) else {
            return Ok(missing(COLLECTION_IDS));
        };
        let mut fan = FanOut::default();
        for cid in ids {
            let path = format!("/collections/{cid}/manifest");
            match self.caller.call(ApiRequest::get(path)).await {
                Ok(data) => fan.entries.push(json!({
                    "collection_id": cid,
                    "objects": truncated(data.get("objects"), SAMPLE_DEPTH),
                })),
                Err(err) => fan.failed(json!({"collection_id": cid}), err),
            }
        }
        fan.finish(serde_json::Map::new())
    }
}

struct Objects {
    caller: Arc<dyn ApiCaller>,
}

#[async_trait]
impl Invoke for Objects {
    async fn invoke(&self, state: &DependencyState) -> Result<Value, StageError> {
        let Some(ids) = collection_ids(state) else {
            return Ok(missing(COLLECTION_IDS));
        };
        let mut fan = FanOut::default();
        let mut refs = Vec::new();
        for cid in ids {
            let path = format!("/collections/{cid}/objects");
            let data = match self.caller.call(ApiRequest::get(path)).await {
                Ok(data) => data,
                Err(err) => {
                    fan.failed(json!({"collection_id": cid}), err);
                    continue;
                }
            };

            let mut objects = truncated(data.get("objects"), SAMPLE_DEPTH);
            for object in &mut objects {
                if let Some(contents) = object.get_mut("x_mitre_contents") {
                    if let Some(items) = contents.as_array_mut() {
                        items.truncate(SAMPLE_DEPTH);
                    }
                }
                if let Some(id) = object.get("id").and_then(Value::as_str) {
                    refs.push(json!({"collection_id": cid, "object_id": id}));
                }
            }
            fan.entries
                .push(json!({"collection_id": cid, "objects": objects}));
        }

        let mut payload = serde_json::Map::new();
        payload.insert(OBJECT_REFS.into(), Value::Array(refs));
        fan.finish(payload)
    }
}

struct Versions {
    caller: Arc<dyn ApiCaller>,
}

#[async_trait]
impl Invoke for Versions {
    async fn invoke(&self, state: &DependencyState) -> Result<Value, StageError> {
        let refs = match state.get(&StateKey::new(OBJECT_REFS)).and_then(Value::as_array) {
            Some(refs) if !refs.is_empty() => refs.clone(),
            _ => return Ok(missing(OBJECT_REFS)),
        };
        let mut fan = FanOut::default();
        for entry in refs {
            let (Some(cid), Some(oid)) = (
                entry.get("collection_id").and_then(Value::as_str),
                entry.get("object_id").and_then(Value::as_str),
            ) else {
                continue;
            };
            let path = format!("/collections/{cid}/objects/{oid}/versions");
            match self.caller.call(ApiRequest::get(path)).await {
                Ok(versions) => fan.entries.push(json!({
                    "collection_id": cid,
                    "object_id": oid,
                    "versions": versions,
                })),
                Err(err) => fan.failed(json!({"collection_id": cid, "object_id": oid}), err),
            }
        }
        fan.finish(serde_json::Map::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves canned payloads keyed by path.
    struct Canned {
        routes: Vec<(String, Result<Value, HttpError>)>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ApiCaller for Canned {
        async fn call(&self, request: ApiRequest) -> Result<Value, HttpError> {
            self.seen.lock().unwrap().push(request.path.clone());
            self.routes
                .iter()
                .find(|(path, _)| *path == request.path)
                .map(|(_, response)| response.clone())
                .unwrap_or(Err(HttpError::Status {
                    status: 404,
                    body: "not found".into(),
                }))
        }
    }

    #[tokio::test]
    async fn objects_truncate_and_publish_refs() {
        let caller = Canned {
            routes: vec![(
                "/collections/c1/objects".into(),
                Ok(json!({"objects": [
                    {"id": "o1", "x_mitre_contents": [1, 2, 3, 4, 5]},
                    {"id": "o2"},
                    {"id": "o3"},
                    {"id": "o4"},
                ]})),
            )],
            seen: Mutex::new(Vec::new()),
        };
        let stage = Objects {
            caller: Arc::new(caller),
        };
        let mut state = DependencyState::new();
        state.set(COLLECTION_IDS.into(), json!(["c1", "c2"]));

        let out = stage.invoke(&state).await.unwrap();
        let objects = out["entries"][0]["objects"].as_array().unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0]["x_mitre_contents"], json!([1, 2, 3]));
        assert_eq!(out[OBJECT_REFS].as_array().unwrap().len(), 3);
        assert_eq!(out["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn level_fails_when_every_sub_call_fails() {
        let caller = Canned {
            routes: vec![],
            seen: Mutex::new(Vec::new()),
        };
        let stage = Manifests {
            caller: Arc::new(caller),
        };
        let mut state = DependencyState::new();
        state.set(COLLECTION_IDS.into(), json!(["c1"]));
        let err = stage.invoke(&state).await.unwrap_err();
        assert_eq!(err.to_string(), "404 not found");
    }

    #[tokio::test]
    async fn versions_without_refs_is_a_note() {
        let stage = Versions {
            caller: Arc::new(Canned {
                routes: vec![],
                seen: Mutex::new(Vec::new()),
            }),
        };
        let out = stage.invoke(&DependencyState::new()).await.unwrap();
        assert_eq!(out, json!({"note": "no_object_refs_available"}));
    }

    #[test]
    fn registry_wires_levels_in_order() {
        let caller: Arc<dyn ApiCaller> = Arc::new(Canned {
            routes: vec![],
            seen: Mutex::new(Vec::new()),
        });
        let registry = collection_registry(caller).unwrap();
        assert_eq!(registry.names(), ["collections", "manifest", "objects", "versions"]);
        assert!(registry.unresolved_consumers().is_empty());
    }
}
