//! Shodan REST catalog.
//!
//! Two harvests are offered:
//! - [`endpoint_registry`]: every read endpoint in a fixed order, with the
//!   scan listing feeding the scan lookup through the dependency state
//! - [`harvest_hosts`]: per-IP host summaries, upserted by `ip`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::{ClientSettings, Credential, RateLimitedClient};
use crate::harvest::{ExtractionPolicy, PipelineError, Request, Stage, StageRegistry};
use crate::model::HostSummary;
use crate::store::Sink;
use crate::traits::{ApiCaller, ApiRequest, HttpError};

pub const BASE_URL: &str = "https://api.shodan.io";

/// First scan id seen in the scan listing.
pub const FIRST_SCAN_ID: &str = "first_scan_id";
/// Id of the scan submitted during this run.
pub const LAST_CREATED_SCAN_ID: &str = "last_created_scan_id";

/// Builds a client that sends `key=<api_key>` with every request.
pub fn client(
    api_key: &str,
    min_interval: Duration,
    base_url: Option<&str>,
) -> Result<RateLimitedClient, HttpError> {
    let settings = ClientSettings::new(base_url.unwrap_or(BASE_URL))
        .with_credential(Credential::query("key", api_key))
        .with_min_interval(min_interval);
    RateLimitedClient::new(settings)
}

/// Arguments baked into the endpoint catalog.
#[derive(Debug, Clone)]
pub struct ShodanTargets {
    pub ip: String,
    pub query: String,
    pub facets: String,
    pub saved_query_search: String,
    pub domain: String,
    pub scan_ips: Vec<String>,
}

impl Default for ShodanTargets {
    fn default() -> Self {
        Self {
            ip: "8.8.8.8".into(),
            query: "apache".into(),
            facets: "org,product".into(),
            saved_query_search: "nginx".into(),
            domain: "example.com".into(),
            scan_ips: vec!["8.8.8.8".into()],
        }
    }
}

fn scan_id_fields() -> [&'static str; 3] {
    ["id", "scan_id", "query"]
}

/// The full endpoint catalog in harvest order.
pub fn endpoint_registry(
    caller: Arc<dyn ApiCaller>,
    targets: &ShodanTargets,
) -> Result<StageRegistry, PipelineError> {
    let get = |path: String| Request::get(caller.clone(), path);
    let t = targets;

    let mut registry = StageRegistry::new();
    registry.push(
        Stage::request("host", get(format!("/shodan/host/{}", t.ip))).params(json!({"ip": t.ip})),
    )?;
    registry.push(
        Stage::request(
            "host_count",
            get("/shodan/host/count".into()).param("query", &t.query),
        )
        .params(json!({"query": t.query})),
    )?;
    registry.push(
        Stage::request(
            "host_search_facets",
            get("/shodan/host/search/facets".into())
                .param("query", &t.query)
                .param("facets", &t.facets),
        )
        .params(json!({"query": t.query, "facets": t.facets})),
    )?;
    registry.push(Stage::request(
        "host_search_filters",
        get("/shodan/host/search/filters".into()),
    ))?;
    registry.push(
        Stage::request(
            "host_search_tokens",
            get("/shodan/host/search/tokens".into()).param("query", &t.query),
        )
        .params(json!({"query": t.query})),
    )?;
    registry.push(Stage::request("ports", get("/shodan/ports".into())))?;
    registry.push(Stage::request("protocols", get("/shodan/protocols".into())))?;
    registry.push(
        Stage::request("scans", get("/shodan/scans".into())).produces(
            FIRST_SCAN_ID,
            ExtractionPolicy::first_id(["scans", "matches", "data", "results"], scan_id_fields()),
        ),
    )?;
    registry.push(
        Stage::request(
            "scan_get",
            get(format!("/shodan/scan/{{{FIRST_SCAN_ID}}}"))
                .when_missing(json!({"note": "no_scan_id_available"})),
        )
        .params(json!({"scan_id": "derived from scans"})),
    )?;
    registry.push(
        Stage::request(
            "scan_create",
            Request::new(caller.clone(), Method::POST, "/shodan/scan")
                .body(json!({"ips": t.scan_ips.join(",")})),
        )
        .params(json!({"ips": t.scan_ips}))
        .produces(
            LAST_CREATED_SCAN_ID,
            ExtractionPolicy::first_id(Vec::<String>::new(), scan_id_fields()),
        ),
    )?;
    registry.push(Stage::request("alert_info", get("/shodan/alert/info".into())))?;
    registry.push(Stage::request(
        "alert_triggers",
        get("/shodan/alert/triggers".into()),
    ))?;
    registry.push(Stage::request("notifier_list", get("/notifier".into())))?;
    registry.push(Stage::request(
        "notifier_providers",
        get("/notifier/provider".into()),
    ))?;
    registry.push(Stage::request("query_list", get("/shodan/query".into())))?;
    registry.push(
        Stage::request(
            "query_search",
            get("/shodan/query/search".into()).param("query", &t.saved_query_search),
        )
        .params(json!({"query": t.saved_query_search})),
    )?;
    registry.push(Stage::request("query_tags", get("/shodan/query/tags".into())))?;
    registry.push(
        Stage::request("dns_domain", get(format!("/dns/domain/{}", t.domain)))
            .params(json!({"domain": t.domain})),
    )?;
    registry.push(
        Stage::request(
            "tools_httpheaders",
            get("/tools/httpheaders".into()).param("host", &t.domain),
        )
        .params(json!({"host": t.domain})),
    )?;
    registry.push(Stage::request("tools_myip", get("/tools/myip".into())))?;
    registry.push(Stage::request("api_info", get("/api-info".into())))?;
    registry.push(Stage::request("account_profile", get("/account/profile".into())))?;
    Ok(registry)
}

// ============================================================================
// Host summaries
// ============================================================================

/// Projects a raw `/shodan/host/{ip}` payload onto a [`HostSummary`].
pub fn transform_host(raw: &Value) -> HostSummary {
    let text = |field: &str| raw.get(field).and_then(Value::as_str).map(str::to_string);
    let list = |field: &str| {
        raw.get(field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    HostSummary {
        ip: text("ip_str"),
        org: text("org"),
        os: text("os"),
        isp: text("isp"),
        hostnames: list("hostnames"),
        ports: list("ports"),
        last_update: text("last_update"),
        country: text("country_name"),
        timestamp: Utc::now(),
    }
}

#[derive(Debug, Default)]
pub struct HostHarvestSummary {
    pub upserted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Fetches each IP's host record and upserts its summary.
///
/// A failed lookup or write is logged and the next IP is processed.
pub async fn harvest_hosts(
    caller: &dyn ApiCaller,
    ips: &[String],
    sink: &Sink,
) -> HostHarvestSummary {
    let mut summary = HostHarvestSummary::default();
    for ip in ips {
        let raw = match caller.call(ApiRequest::get(format!("/shodan/host/{ip}"))).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(ip = %ip, error = %err, "Host lookup failed");
                summary.failed.push((ip.clone(), err.to_string()));
                continue;
            }
        };

        let host = transform_host(&raw);
        let stored = match serde_json::to_value(&host) {
            Ok(doc) => sink.store_document(doc).await,
            Err(err) => Err(err.into()),
        };
        match stored {
            Ok(()) => summary.upserted.push(ip.clone()),
            Err(err) => {
                warn!(ip = %ip, error = %err, "Host summary not stored");
                summary.failed.push((ip.clone(), err.to_string()));
            }
        }
    }
    info!(
        upserted = summary.upserted.len(),
        failed = summary.failed.len(),
        "Inserted/Updated host documents"
    );
    summary
}
