//! Thin client over the session and KV endpoints of the Consul HTTP API.

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::{ConsulConfig, ConsulError, ConsulResult};
use bytes::Bytes;
use leaderkey_core::{SessionBehavior, SessionRequest};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TOKEN_HEADER: &str = "x-consul-token";
const INDEX_HEADER: &str = "x-consul-index";

/// Body of `PUT /v1/session/create`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionCreateRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    #[serde(rename = "Behavior")]
    pub behavior: String,
    #[serde(rename = "LockDelay")]
    pub lock_delay: String,
    #[serde(rename = "Checks", skip_serializing_if = "Option::is_none")]
    pub checks: Option<Vec<String>>,
    #[serde(rename = "NodeChecks", skip_serializing_if = "Option::is_none")]
    pub node_checks: Option<Vec<String>>,
    #[serde(rename = "ServiceChecks", skip_serializing_if = "Option::is_none")]
    pub service_checks: Option<Vec<ServiceCheckEntry>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCheckEntry {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Namespace", skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl From<&SessionRequest> for SessionCreateRequest {
    fn from(request: &SessionRequest) -> Self {
        let checks = &request.checks;

        // An explicit empty NodeChecks list keeps the agent from binding the
        // session to serfHealth.
        let (node_checks, plain_checks, service_checks) = if checks.is_empty() {
            (Some(Vec::new()), None, None)
        } else {
            (
                non_empty(checks.node_checks.clone()),
                non_empty(checks.checks.clone()),
                non_empty(
                    checks
                        .service_checks
                        .iter()
                        .map(|check| ServiceCheckEntry {
                            id: check.id.clone(),
                            namespace: check.namespace.clone(),
                        })
                        .collect(),
                ),
            )
        };

        Self {
            name: request.name.clone(),
            ttl: duration_string(request.ttl),
            behavior: behavior_string(request.behavior).to_string(),
            lock_delay: duration_string(request.lock_delay),
            checks: plain_checks,
            node_checks,
            service_checks,
        }
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn behavior_string(behavior: SessionBehavior) -> &'static str {
    behavior.as_str()
}

#[derive(Debug, Clone, Deserialize)]
struct SessionCreateResponse {
    #[serde(rename = "ID")]
    id: String,
}

/// One entry returned by `GET /v1/kv/{key}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KvPair {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "CreateIndex", default)]
    pub create_index: u64,
    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,
    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,
    #[serde(rename = "Flags", default)]
    pub flags: u64,
    /// Base64 encoded payload
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
    #[serde(rename = "Session", default)]
    pub session: Option<String>,
}

/// Formats a duration the way Consul parses it.
pub fn duration_string(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Client for the Consul endpoints used by locks
pub struct ConsulClient {
    base: Url,
    config: ConsulConfig,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for ConsulClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulClient")
            .field("base", &self.base.as_str())
            .field("datacenter", &self.config.datacenter)
            .finish()
    }
}

impl ConsulClient {
    pub fn new(config: ConsulConfig) -> ConsulResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout)?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(
        config: ConsulConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> ConsulResult<Self> {
        let base = config.base_url()?;
        Ok(Self {
            base,
            config,
            transport,
        })
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    pub async fn create_session(&self, body: &SessionCreateRequest) -> ConsulResult<String> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| ConsulError::invalid_request(format!("session body: {}", e)))?;
        let request = self
            .request(Method::PUT, &["v1", "session", "create"], Vec::new())?
            .with_body(payload);

        let response = self.execute("session create", request).await?;
        let created: SessionCreateResponse = decode("session create", &response)?;
        Ok(created.id)
    }

    /// Returns `false` when the agent no longer knows the session.
    pub async fn renew_session(&self, id: &str) -> ConsulResult<bool> {
        let request = self.request(Method::PUT, &["v1", "session", "renew", id], Vec::new())?;
        let response = self.send("session renew", request).await?;

        match response.status {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(unexpected("session renew", status, &response)),
        }
    }

    pub async fn destroy_session(&self, id: &str) -> ConsulResult<()> {
        let request = self.request(Method::PUT, &["v1", "session", "destroy", id], Vec::new())?;
        self.execute("session destroy", request).await?;
        Ok(())
    }

    /// Reads a key. With `index` set this is a blocking query that returns
    /// once the key changes past `index` or `wait` elapses.
    ///
    /// Returns the entry, if any, and the `X-Consul-Index` of the response.
    pub async fn get_key(
        &self,
        key: &str,
        index: Option<u64>,
        wait: Duration,
    ) -> ConsulResult<(Option<KvPair>, u64)> {
        let mut query = Vec::new();
        let mut request_timeout = self.config.request_timeout;
        if let Some(index) = index {
            query.push(("index", index.to_string()));
            query.push(("wait", duration_string(wait)));
            // The agent adds up to wait/16 of jitter to blocking queries.
            request_timeout += wait + wait / 16;
        }

        let request = self
            .request(Method::GET, &kv_segments(key), query)?
            .with_timeout(request_timeout);
        let response = self.send("kv get", request).await?;
        let last_index = response.header_u64(INDEX_HEADER).unwrap_or(0);

        match response.status {
            StatusCode::NOT_FOUND => Ok((None, last_index)),
            status if status.is_success() => {
                let pairs: Vec<KvPair> = decode("kv get", &response)?;
                Ok((pairs.into_iter().next(), last_index))
            }
            status => Err(unexpected("kv get", status, &response)),
        }
    }

    /// `PUT /v1/kv/{key}?acquire={session}`; `true` when the lock is now held.
    pub async fn acquire_key(
        &self,
        key: &str,
        session: &str,
        flags: u64,
        value: Option<&Bytes>,
    ) -> ConsulResult<bool> {
        let query = vec![("acquire", session.to_string()), ("flags", flags.to_string())];
        let mut request = self.request(Method::PUT, &kv_segments(key), query)?;
        if let Some(value) = value {
            request = request.with_body(value.clone());
        }

        let response = self.execute("kv acquire", request).await?;
        decode("kv acquire", &response)
    }

    /// `PUT /v1/kv/{key}?release={session}`
    pub async fn release_key(&self, key: &str, session: &str, flags: u64) -> ConsulResult<bool> {
        let query = vec![("release", session.to_string()), ("flags", flags.to_string())];
        let request = self.request(Method::PUT, &kv_segments(key), query)?;

        let response = self.execute("kv release", request).await?;
        decode("kv release", &response)
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
        mut query: Vec<(&str, String)>,
    ) -> ConsulResult<HttpRequest> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ConsulError::invalid_address(self.base.as_str(), "not a base URL"))?
            .pop_if_empty()
            .extend(segments);

        if let Some(datacenter) = &self.config.datacenter {
            query.push(("dc", datacenter.clone()));
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &query {
                pairs.append_pair(name, value);
            }
        }

        let mut request = HttpRequest::new(method, url);
        if let Some(token) = &self.config.token {
            request = request.with_header(TOKEN_HEADER, token)?;
        }
        Ok(request)
    }

    async fn send(&self, operation: &str, request: HttpRequest) -> ConsulResult<HttpResponse> {
        debug!("Consul {} {}", operation, request.url.path());
        self.transport.send(request).await
    }

    /// Sends and fails on any non-success status.
    async fn execute(&self, operation: &str, request: HttpRequest) -> ConsulResult<HttpResponse> {
        let response = self.send(operation, request).await?;
        if !response.status.is_success() {
            return Err(unexpected(operation, response.status, &response));
        }
        Ok(response)
    }
}

fn kv_segments(key: &str) -> Vec<&str> {
    let mut segments = vec!["v1", "kv"];
    segments.extend(key.split('/'));
    segments
}

fn decode<T: serde::de::DeserializeOwned>(
    operation: &str,
    response: &HttpResponse,
) -> ConsulResult<T> {
    serde_json::from_slice(&response.body).map_err(|source| ConsulError::Decode {
        operation: operation.to_string(),
        source,
    })
}

fn unexpected(operation: &str, status: StatusCode, response: &HttpResponse) -> ConsulError {
    ConsulError::UnexpectedStatus {
        operation: operation.to_string(),
        status: status.as_u16(),
        body: response.text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaderkey_core::{HealthChecks, ServiceCheck};

    fn session_request(checks: HealthChecks) -> SessionRequest {
        SessionRequest {
            name: "Consul API Lock".to_string(),
            ttl: Duration::from_secs(15),
            behavior: SessionBehavior::Release,
            lock_delay: Duration::from_millis(1500),
            checks,
        }
    }

    #[test]
    fn test_duration_string() {
        assert_eq!(duration_string(Duration::from_secs(15)), "15s");
        assert_eq!(duration_string(Duration::from_millis(1500)), "1500ms");
        assert_eq!(duration_string(Duration::ZERO), "0s");
    }

    #[test]
    fn test_session_body_without_checks() {
        let body = SessionCreateRequest::from(&session_request(HealthChecks::default()));
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["Name"], "Consul API Lock");
        assert_eq!(json["TTL"], "15s");
        assert_eq!(json["Behavior"], "release");
        assert_eq!(json["LockDelay"], "1500ms");
        assert_eq!(json["NodeChecks"], serde_json::json!([]));
        assert!(json.get("Checks").is_none());
        assert!(json.get("ServiceChecks").is_none());
    }

    #[test]
    fn test_session_body_with_checks() {
        let checks = HealthChecks {
            checks: vec!["serfHealth".to_string()],
            node_checks: Vec::new(),
            service_checks: vec![ServiceCheck::new("service:web").with_namespace("prod")],
        };
        let body = SessionCreateRequest::from(&session_request(checks));
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["Checks"], serde_json::json!(["serfHealth"]));
        assert!(json.get("NodeChecks").is_none());
        assert_eq!(json["ServiceChecks"][0]["ID"], "service:web");
        assert_eq!(json["ServiceChecks"][0]["Namespace"], "prod");
    }

    #[test]
    fn test_kv_pair_decoding() {
        let body = r#"[{"LockIndex":1,"Key":"svc/leader","Flags":3304740253564472344,
            "Value":null,"Session":"adf4238a","CreateIndex":5,"ModifyIndex":6}]"#;
        let pairs: Vec<KvPair> = serde_json::from_str(body).unwrap();

        assert_eq!(pairs[0].key, "svc/leader");
        assert_eq!(pairs[0].session.as_deref(), Some("adf4238a"));
        assert_eq!(pairs[0].flags, 0x2ddccbc058a50c18);
    }

    #[test]
    fn test_request_urls() {
        let config = ConsulConfig::default()
            .with_datacenter("dc2")
            .with_token("secret");
        let client = ConsulClient::new(config).unwrap();

        let request = client
            .request(
                Method::PUT,
                &kv_segments("svc/leader"),
                vec![("acquire", "abc".to_string())],
            )
            .unwrap();

        assert_eq!(
            request.url.as_str(),
            "http://127.0.0.1:8500/v1/kv/svc/leader?acquire=abc&dc=dc2"
        );
        assert_eq!(request.headers.get(TOKEN_HEADER).unwrap(), "secret");
    }
}
