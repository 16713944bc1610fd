//! Ordered stage definitions.
//!
//! A [`StageRegistry`] is built once before a run and never reordered.
//! Stages talk to each other only through [`DependencyState`]: a producer
//! declares the key it publishes and how to find it, a consumer declares
//! the keys it reads.

use std::fmt;
use std::sync::Arc;

use reqwest::Method;
use serde_json::{json, Map, Value};

use crate::harvest::pipeline::PipelineError;
use crate::harvest::traits::{
    DependencyState, ExtractionPolicy, FnInvoke, Invoke, StageError, StateKey,
};
use crate::traits::{ApiCaller, ApiRequest};

// ============================================================================
// Stage
// ============================================================================

/// One named unit of work.
pub struct Stage {
    name: String,
    params: Map<String, Value>,
    produces: Option<(StateKey, ExtractionPolicy)>,
    consumes: Vec<StateKey>,
    invoke: Box<dyn Invoke>,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("produces", &self.produces)
            .field("consumes", &self.consumes)
            .finish_non_exhaustive()
    }
}

impl Stage {
    pub fn new(name: impl Into<String>, invoke: impl Invoke + 'static) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
            produces: None,
            consumes: Vec::new(),
            invoke: Box::new(invoke),
        }
    }

    /// Stage backed by an async closure receiving a state snapshot.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(DependencyState) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, StageError>> + Send + 'static,
    {
        Self::new(name, FnInvoke(f))
    }

    /// Stage backed by a single API request; the request's placeholders
    /// become the stage's consumed keys.
    pub fn request(name: impl Into<String>, request: Request) -> Self {
        let consumes = request.consumed_keys();
        let mut stage = Self::new(name, request);
        stage.consumes = consumes;
        stage
    }

    /// Declared parameters, recorded verbatim in the stage's record.
    pub fn params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    pub fn produces(mut self, key: impl Into<StateKey>, policy: ExtractionPolicy) -> Self {
        self.produces = Some((key.into(), policy));
        self
    }

    pub fn consumes(mut self, key: impl Into<StateKey>) -> Self {
        let key = key.into();
        if !self.consumes.contains(&key) {
            self.consumes.push(key);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn production(&self) -> Option<&(StateKey, ExtractionPolicy)> {
        self.produces.as_ref()
    }

    pub fn consumed_keys(&self) -> &[StateKey] {
        &self.consumes
    }

    pub async fn invoke(&self, state: &DependencyState) -> Result<Value, StageError> {
        self.invoke.invoke(state).await
    }
}

// ============================================================================
// Request invocation
// ============================================================================

#[derive(Debug, Clone)]
enum ParamSource {
    Literal(String),
    State(StateKey),
}

/// An API call whose path and query may reference [`DependencyState`].
///
/// Path placeholders are written `{key}`. When a referenced key is absent
/// the call is skipped and the placeholder payload is returned instead, so
/// a consumer never fails because a producer found nothing.
#[derive(Clone)]
pub struct Request {
    caller: Arc<dyn ApiCaller>,
    method: Method,
    path: String,
    params: Vec<(String, ParamSource)>,
    body: Option<Value>,
    when_missing: Option<Value>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn new(caller: Arc<dyn ApiCaller>, method: Method, path: impl Into<String>) -> Self {
        Self {
            caller,
            method,
            path: path.into(),
            params: Vec::new(),
            body: None,
            when_missing: None,
        }
    }

    pub fn get(caller: Arc<dyn ApiCaller>, path: impl Into<String>) -> Self {
        Self::new(caller, Method::GET, path)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params
            .push((name.into(), ParamSource::Literal(value.to_string())));
        self
    }

    /// Query parameter filled from state at invocation time.
    pub fn state_param(mut self, name: impl Into<String>, key: impl Into<StateKey>) -> Self {
        self.params.push((name.into(), ParamSource::State(key.into())));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Payload returned in place of the call when a consumed key is absent.
    pub fn when_missing(mut self, placeholder: Value) -> Self {
        self.when_missing = Some(placeholder);
        self
    }

    pub fn consumed_keys(&self) -> Vec<StateKey> {
        let mut keys: Vec<StateKey> = placeholders(&self.path)
            .into_iter()
            .map(StateKey::new)
            .collect();
        for (_, source) in &self.params {
            if let ParamSource::State(key) = source {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    fn placeholder_for(&self, key: &StateKey) -> Value {
        self.when_missing
            .clone()
            .unwrap_or_else(|| json!({ "note": format!("no_{key}_available") }))
    }

    /// Resolves the template against `state`; `Err(key)` names the first
    /// absent key.
    fn resolve(&self, state: &DependencyState) -> Result<ApiRequest, StateKey> {
        let mut path = self.path.clone();
        for name in placeholders(&self.path) {
            let key = StateKey::new(name);
            let value = state.get_text(&key).ok_or_else(|| key.clone())?;
            path = path.replace(&format!("{{{name}}}"), &value);
        }

        let mut request = ApiRequest::new(self.method.clone(), path);
        for (name, source) in &self.params {
            let value = match source {
                ParamSource::Literal(value) => value.clone(),
                ParamSource::State(key) => state.get_text(key).ok_or_else(|| key.clone())?,
            };
            request = request.param(name.clone(), value);
        }
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }
        Ok(request)
    }
}

#[async_trait::async_trait]
impl Invoke for Request {
    async fn invoke(&self, state: &DependencyState) -> Result<Value, StageError> {
        match self.resolve(state) {
            Ok(request) => Ok(self.caller.call(request).await?),
            Err(missing) => {
                tracing::debug!(key = %missing, path = %self.path, "Dependency absent, using placeholder");
                Ok(self.placeholder_for(&missing))
            }
        }
    }
}

/// Names inside `{...}` in a path template, in order of appearance.
fn placeholders(template: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    names
}

// ============================================================================
// Registry
// ============================================================================

/// Append-only, ordered list of stages with unique names.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: Vec<Stage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) -> Result<(), PipelineError> {
        if self.stages.iter().any(|existing| existing.name == stage.name) {
            return Err(PipelineError::DuplicateStage(stage.name));
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Builder form of [`StageRegistry::push`].
    pub fn with(mut self, stage: Stage) -> Result<Self, PipelineError> {
        self.push(stage)?;
        Ok(self)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// `(stage, key)` pairs where a stage consumes a key that no earlier
    /// stage produces. Such stages always run on their placeholder.
    pub fn unresolved_consumers(&self) -> Vec<(&str, &StateKey)> {
        let mut produced: Vec<&StateKey> = Vec::new();
        let mut unresolved = Vec::new();
        for stage in &self.stages {
            for key in &stage.consumes {
                if !produced.contains(&key) {
                    unresolved.push((stage.name(), key));
                }
            }
            if let Some((key, _)) = &stage.produces {
                produced.push(key);
            }
        }
        unresolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::HttpError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCaller {
        seen: Mutex<Vec<ApiRequest>>,
    }

    #[async_trait]
    impl ApiCaller for RecordingCaller {
        async fn call(&self, request: ApiRequest) -> Result<Value, HttpError> {
            let path = request.path.clone();
            self.seen.lock().unwrap().push(request);
            Ok(json!({ "path": path }))
        }
    }

    fn noop(name: &str) -> Stage {
        Stage::from_fn(name, |_| async { Ok::<_, StageError>(Value::Null) })
    }

    #[test]
    fn placeholders_are_found_in_order() {
        assert_eq!(
            placeholders("/alert/{alert_id}/trigger/{trigger}"),
            ["alert_id", "trigger"]
        );
        assert!(placeholders("/shodan/ports").is_empty());
        assert!(placeholders("/broken/{open").is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = StageRegistry::new();
        registry.push(noop("ports")).unwrap();
        let err = registry.push(noop("ports")).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateStage(name) if name == "ports"));
        assert_eq!(registry.names(), ["ports"]);
    }

    #[test]
    fn request_stage_consumes_its_placeholders() {
        let caller: Arc<dyn ApiCaller> = Arc::new(RecordingCaller::default());
        let stage = Stage::request(
            "scan_get",
            Request::get(caller, "/shodan/scan/{first_scan_id}").state_param("q", "query_key"),
        );
        assert_eq!(
            stage.consumed_keys(),
            [StateKey::new("first_scan_id"), StateKey::new("query_key")]
        );
    }

    #[test]
    fn unresolved_consumers_respect_order() {
        let registry = StageRegistry::new()
            .with(noop("get").consumes("id"))
            .unwrap()
            .with(noop("list").produces("id", ExtractionPolicy::first_id(["items"], ["id"])))
            .unwrap()
            .with(noop("get_again").consumes("id"))
            .unwrap();
        let unresolved = registry.unresolved_consumers();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].0, "get");
    }

    #[tokio::test]
    async fn request_substitutes_state_values() {
        let caller = Arc::new(RecordingCaller::default());
        let request = Request::get(caller.clone(), "/shodan/scan/{first_scan_id}");
        let mut state = DependencyState::new();
        state.set("first_scan_id".into(), json!("ABC123"));

        let out = request.invoke(&state).await.unwrap();
        assert_eq!(out, json!({"path": "/shodan/scan/ABC123"}));
        assert_eq!(caller.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn request_uses_placeholder_when_state_absent() {
        let caller = Arc::new(RecordingCaller::default());
        let request = Request::get(caller.clone(), "/shodan/scan/{first_scan_id}")
            .when_missing(json!({"note": "no_scan_id_available"}));

        let out = request.invoke(&DependencyState::new()).await.unwrap();
        assert_eq!(out, json!({"note": "no_scan_id_available"}));
        assert!(caller.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_placeholder_names_the_key() {
        let caller: Arc<dyn ApiCaller> = Arc::new(RecordingCaller::default());
        let request = Request::get(caller, "/x").state_param("id", "object_id");
        let out = request.invoke(&DependencyState::new()).await.unwrap();
        assert_eq!(out, json!({"note": "no_object_id_available"}));
    }

    #[test]
    fn params_keep_declared_object() {
        let stage = noop("host").params(json!({"ip": "8.8.8.8"}));
        assert_eq!(stage.declared_params().get("ip"), Some(&json!("8.8.8.8")));
    }
}
