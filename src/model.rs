use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub endpoint: String,
    pub params: Map<String, Value>,
    pub result: Value,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub endpoint: String,
    pub params: Map<String, Value>,
    pub error: String,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of one stage as written to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HarvestRecord {
    Success(SuccessRecord),
    Error(ErrorRecord),
}

impl HarvestRecord {
    pub fn success(endpoint: &str, params: Map<String, Value>, result: Value) -> Self {
        Self::Success(SuccessRecord {
            endpoint: endpoint.to_string(),
            params,
            result,
            fetched_at: Utc::now(),
        })
    }

    pub fn error(endpoint: &str, params: Map<String, Value>, error: impl ToString) -> Self {
        Self::Error(ErrorRecord {
            endpoint: endpoint.to_string(),
            params,
            error: error.to_string(),
            fetched_at: Utc::now(),
        })
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::Success(record) => &record.endpoint,
            Self::Error(record) => &record.endpoint,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Renders the record as the document handed to the store.
    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Current known facts about one Shodan host, upserted by `ip`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSummary {
    pub ip: Option<String>,
    pub org: Option<String>,
    pub os: Option<String>,
    pub isp: Option<String>,
    pub hostnames: Vec<Value>,
    pub ports: Vec<Value>,
    pub last_update: Option<String>,
    pub country: Option<String>,
    pub timestamp: DateTime<Utc>,
}
