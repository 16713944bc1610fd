//! Startup configuration.
//!
//! Values come from the process environment, optionally seeded from a
//! `.env` file. Everything is validated once; a missing credential is a
//! fatal startup error rather than a per-call failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::harvest::SinkFailurePolicy;
use crate::store::StoreCredentials;

pub const DEFAULT_STORE_URI: &str = "ws://localhost:8000";
pub const DEFAULT_DB_NAME: &str = "shodan_db";
pub const DEFAULT_COLLECTION_NAME: &str = "shodan_results";
pub const DEFAULT_TAXII_DB_NAME: &str = "mitre_attack";
pub const DEFAULT_TAXII_COLLECTION_NAME: &str = "attack_objects";
pub const DEFAULT_RATE_LIMIT_DELAY_SECS: f64 = 1.1;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TARGET_IP: &str = "8.8.8.8";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

/// Which harvest the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Every Shodan endpoint, appended as harvest records.
    Shodan,
    /// Shodan host summaries, upserted by IP.
    ShodanHosts,
    /// MITRE ATT&CK TAXII collections fan-out.
    Taxii,
}

impl SourceKind {
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Taxii)
    }

    /// Variables naming the database and collection, with their defaults.
    fn store_target(self) -> [(&'static str, &'static str); 2] {
        match self {
            Self::Shodan | Self::ShodanHosts => [
                ("DB_NAME_shodan", DEFAULT_DB_NAME),
                ("COLLECTION_NAME_shodan", DEFAULT_COLLECTION_NAME),
            ],
            Self::Taxii => [
                ("DB_NAME_mitre", DEFAULT_TAXII_DB_NAME),
                ("COLLECTION_NAME_mitre", DEFAULT_TAXII_COLLECTION_NAME),
            ],
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "shodan" => Ok(Self::Shodan),
            "shodan-hosts" | "shodan_hosts" => Ok(Self::ShodanHosts),
            "taxii" | "mitre" => Ok(Self::Taxii),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

#[derive(Clone)]
pub struct HarvestConfig {
    pub source: SourceKind,
    pub api_key: Option<String>,
    pub store_uri: String,
    pub store_credentials: Option<StoreCredentials>,
    pub db_name: String,
    pub collection_name: String,
    pub rate_limit_delay: Duration,
    pub stage_timeout: Duration,
    pub sink_policy: SinkFailurePolicy,
    pub target_ips: Vec<String>,
}

impl std::fmt::Debug for HarvestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestConfig")
            .field("source", &self.source)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("store_uri", &self.store_uri)
            .field("store_credentials", &self.store_credentials)
            .field("db_name", &self.db_name)
            .field("collection_name", &self.collection_name)
            .field("rate_limit_delay", &self.rate_limit_delay)
            .field("stage_timeout", &self.stage_timeout)
            .field("sink_policy", &self.sink_policy)
            .field("target_ips", &self.target_ips)
            .finish()
    }
}

impl HarvestConfig {
    /// The credential, or `MissingVar` when the selected source needs one.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or(ConfigError::MissingVar("SHODAN_API_KEY"))
    }

    /// Builds a configuration from explicit variables; the loader feeds it
    /// the process environment.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            vars.get(name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        let source = match get("HARVEST_SOURCE") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidVar {
                name: "HARVEST_SOURCE",
                value: raw.to_string(),
                reason,
            })?,
            None => SourceKind::Shodan,
        };

        let rate_limit_delay = match get("RATE_LIMIT_DELAY") {
            Some(raw) => parse_seconds("RATE_LIMIT_DELAY", raw)?,
            None => Duration::from_secs_f64(DEFAULT_RATE_LIMIT_DELAY_SECS),
        };

        let stage_timeout = match get("HARVEST_STAGE_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|err| ConfigError::InvalidVar {
                    name: "HARVEST_STAGE_TIMEOUT_SECS",
                    value: raw.to_string(),
                    reason: err.to_string(),
                })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        };

        let sink_policy = match get("HARVEST_SINK_POLICY") {
            None => SinkFailurePolicy::Continue,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "continue" => SinkFailurePolicy::Continue,
                "abort" => SinkFailurePolicy::Abort,
                _ => {
                    return Err(ConfigError::InvalidVar {
                        name: "HARVEST_SINK_POLICY",
                        value: raw.to_string(),
                        reason: "expected 'continue' or 'abort'".into(),
                    })
                }
            },
        };

        let target_ips: Vec<String> = get("HARVEST_TARGET_IPS")
            .unwrap_or(DEFAULT_TARGET_IP)
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .collect();

        let store_credentials = match (get("HARVEST_STORE_USER"), get("HARVEST_STORE_PASS")) {
            (Some(username), Some(password)) => Some(StoreCredentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingVar("HARVEST_STORE_PASS")),
            (None, Some(_)) => return Err(ConfigError::MissingVar("HARVEST_STORE_USER")),
        };

        let [(db_var, db_default), (collection_var, collection_default)] = source.store_target();

        let config = Self {
            source,
            api_key: get("SHODAN_API_KEY").map(str::to_string),
            store_uri: get("MONGO_URI").unwrap_or(DEFAULT_STORE_URI).to_string(),
            store_credentials,
            db_name: get(db_var).unwrap_or(db_default).to_string(),
            collection_name: get(collection_var)
                .unwrap_or(collection_default)
                .to_string(),
            rate_limit_delay,
            stage_timeout,
            sink_policy,
            target_ips,
        };

        if config.source.requires_api_key() {
            config.require_api_key()?;
        }
        Ok(config)
    }
}

fn parse_seconds(name: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidVar {
        name,
        value: raw.to_string(),
        reason,
    };
    let secs = raw.parse::<f64>().map_err(|err| invalid(err.to_string()))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid("must be a non-negative number of seconds".into()));
    }
    Duration::try_from_secs_f64(secs).map_err(|err| invalid(err.to_string()))
}

/// Loads `.env` (if present) and then reads the environment.
#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    env_file: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<HarvestConfig, ConfigError> {
        let loaded = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match loaded {
            Ok(_) => {}
            Err(dotenvy::Error::Io(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let vars: HashMap<String, String> = std::env::vars().collect();
        HarvestConfig::from_vars(&vars)
    }
}
