use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure of a single upstream call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The upstream answered with a non-success status code.
    #[error("{status} {body}")]
    Status { status: u16, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
    /// Upsert requested but the document lacks one of the key fields.
    #[error("document has no value for key field '{0}'")]
    MissingKey(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One outbound request, described independently of the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            params: Vec::new(),
            body: None,
        }
    }

    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            ..Self::get(path)
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Issues calls against one upstream API.
#[async_trait]
pub trait ApiCaller: Send + Sync {
    /// Performs the request and returns the decoded payload.
    ///
    /// A success body that is not JSON still succeeds and yields
    /// `{"raw_text": "<body>"}`.
    async fn call(&self, request: ApiRequest) -> Result<Value, HttpError>;
}

/// Document-oriented persistence backend.
///
/// Connection lifecycle belongs to whoever constructs the store; the
/// harvester only ever receives an open handle.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a new independent document and returns its id.
    async fn insert(&self, collection: &str, doc: Value) -> Result<String, PersistenceError>;

    /// Overwrites the fields of the document matching `key` (all pairs equal),
    /// inserting it when no such document exists.
    async fn upsert_by_key(
        &self,
        collection: &str,
        key: Map<String, Value>,
        doc: Value,
    ) -> Result<(), PersistenceError>;
}
