//! Client for the upstream consolidated screening list search API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use csl_core::{decode_objects, EntityRecord, SearchParams};
use reqwest::header::CACHE_CONTROL;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "csl-client";

pub const DEFAULT_API_URL: &str = "https://data.trade.gov/consolidated_screening_list/v1/search";

const SUBSCRIPTION_KEY_HEADER: &str = "subscription-key";

/// Upstream response body.
///
/// Failures are carried in-band through `error`/`message` rather than as `Err`;
/// callers check [`ApiPayload::is_error`] before reading `results`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiPayload {
    #[serde(
        default,
        deserialize_with = "lenient_results",
        skip_serializing_if = "Option::is_none"
    )]
    pub results: Option<Vec<EntityRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Any other top-level keys the upstream sends (sources used, timestamps, ...).
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ApiPayload {
    pub fn failure(error: impl Into<String>, message: Option<String>) -> Self {
        Self {
            error: Some(error.into()),
            message,
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn result_count(&self) -> usize {
        self.results.as_ref().map_or(0, Vec::len)
    }
}

/// Non-object entries are dropped; the rest of the page still decodes.
fn lenient_results<'de, D>(deserializer: D) -> Result<Option<Vec<EntityRecord>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => Some(decode_objects(items)),
        _ => None,
    })
}

#[async_trait]
pub trait ScreeningApi: Send + Sync {
    /// Issue one search. Never fails; transport and HTTP errors come back as an
    /// error-shaped payload.
    async fn search(&self, params: &SearchParams) -> ApiPayload;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub subscription_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            subscription_key: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CslClient {
    client: reqwest::Client,
    base_url: String,
    subscription_key: String,
}

impl CslClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        if config.subscription_key.is_empty() {
            warn!("no subscription key configured; upstream requests will likely be rejected");
        }

        Ok(Self {
            client,
            base_url: config.base_url,
            subscription_key: config.subscription_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, params: &SearchParams) -> ApiPayload {
        let pairs = params.query_pairs();
        debug!(?pairs, "sending search request");

        let response = match self
            .client
            .get(&self.base_url)
            .query(&pairs)
            .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "search request failed");
                return ApiPayload::failure(err.to_string(), None);
            }
        };

        let status = response.status();
        debug!(status = status.as_u16(), "search response received");

        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "upstream returned an error status");
            return ApiPayload::failure(format!("API Error: {}", status.as_u16()), Some(body));
        }

        match response.json::<ApiPayload>().await {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "decoding search response");
                ApiPayload::failure(err.to_string(), None)
            }
        }
    }
}

#[async_trait]
impl ScreeningApi for CslClient {
    async fn search(&self, params: &SearchParams) -> ApiPayload {
        let span = info_span!("csl_search", url = %self.base_url);
        self.send(params).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    async fn spawn_upstream(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}/search")
    }

    async fn echo_handler(
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<JsonValue> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        Json(serde_json::json!({
            "total": 42,
            "results": [
                {"id": "abc", "name": "Acme Corp", "source_list": "SDN"},
                {"name": "Globex", "source_list": "EL", "addresses": null}
            ],
            "echo": {
                "subscription_key": header("subscription-key"),
                "cache_control": header("cache-control"),
                "query": query,
            }
        }))
    }

    fn client_for(url: String) -> CslClient {
        CslClient::new(ClientConfig {
            base_url: url,
            subscription_key: "secret-key".into(),
            timeout: Duration::from_secs(5),
            user_agent: Some("csl-test".into()),
        })
        .expect("client")
    }

    #[tokio::test]
    async fn sends_headers_and_non_empty_params() {
        let url = spawn_upstream(Router::new().route("/search", get(echo_handler))).await;
        let client = client_for(url);

        let payload = client
            .search(&SearchParams {
                name: Some("acme".into()),
                sources: Some("SDN,EL".into()),
                fuzzy_name: Some(true),
                city: Some(String::new()),
                size: Some(100),
                offset: Some(0),
                ..Default::default()
            })
            .await;

        assert!(!payload.is_error());
        assert_eq!(payload.total, Some(42));
        assert_eq!(payload.result_count(), 2);

        let echo = &payload.extra["echo"];
        assert_eq!(echo["subscription_key"], "secret-key");
        assert_eq!(echo["cache_control"], "no-cache");
        assert_eq!(
            echo["query"],
            serde_json::json!({
                "name": "acme",
                "sources": "SDN,EL",
                "fuzzy_name": "true",
                "size": "100"
            })
        );
    }

    #[tokio::test]
    async fn non_200_becomes_error_payload() {
        let router = Router::new().route(
            "/search",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "upstream down") }),
        );
        let client = client_for(spawn_upstream(router).await);

        let payload = client.search(&SearchParams::default()).await;
        assert!(payload.is_error());
        assert_eq!(payload.error.as_deref(), Some("API Error: 503"));
        assert_eq!(payload.message.as_deref(), Some("upstream down"));
        assert_eq!(payload.total, None);
        assert_eq!(payload.result_count(), 0);
    }

    #[tokio::test]
    async fn connection_failure_becomes_error_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = client_for(format!("http://{addr}/search"));
        let payload = client.search(&SearchParams::default()).await;
        assert!(payload.is_error());
        assert!(payload.results.is_none());
    }

    #[tokio::test]
    async fn malformed_child_keeps_total_and_other_records() {
        let router = Router::new().route(
            "/search",
            get(|| async {
                Json(serde_json::json!({
                    "total": 2,
                    "results": [
                        {"id": "a", "name": "Alpha", "source_list": "SDN",
                         "addresses": [{"city": "Tehran", "country": "IR"}]},
                        {"id": "b", "name": "Beta", "source_list": "EL",
                         "addresses": ["1 Main St", null], "ids": [null]},
                        "not a record"
                    ]
                }))
            }),
        );
        let client = client_for(spawn_upstream(router).await);

        let payload = client.search(&SearchParams::default()).await;
        assert!(!payload.is_error());
        assert_eq!(payload.total, Some(2));
        let results = payload.results.expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].addresses.len(), 1);
        assert_eq!(results[1].name.as_deref(), Some("Beta"));
        assert!(results[1].addresses.is_empty());
        assert!(results[1].ids.is_empty());
    }

    #[test]
    fn error_shaped_json_decodes() {
        let payload: ApiPayload = serde_json::from_value(serde_json::json!({
            "error": "API Error: 503",
            "message": "Service Unavailable"
        }))
        .expect("decode");
        assert!(payload.is_error());
        assert!(payload.results.is_none());
        assert!(payload.extra.is_empty());
    }
}
