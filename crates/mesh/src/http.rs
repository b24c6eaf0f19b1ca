//! Consul HTTP API client.

use std::collections::BTreeMap;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use meshsync_core::{ConfigEntry, Error, HealthStatus, MeshRegistration, MeshToken, Placement, RegistrationKey, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{MeshApi, TokenQuery};

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Where and how to reach the mesh control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConnection {
    pub address: String,
    pub http_port: u16,
    pub use_tls: bool,
    pub ca_cert_file: Option<PathBuf>,
    /// PEM-encoded CA, trusted in addition to `ca_cert_file`.
    pub ca_cert_pem: Option<String>,
    /// Name the server certificate is checked against when it differs from `address`.
    pub tls_server_name: Option<String>,
    /// Sent as `X-Consul-Token` on every request.
    pub token: Option<String>,
    pub datacenter: Option<String>,
    pub api_timeout: Duration,
}

impl MeshConnection {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            http_port: 8500,
            use_tls: false,
            ca_cert_file: None,
            ca_cert_pem: None,
            tls_server_name: None,
            token: None,
            datacenter: None,
            api_timeout: Duration::from_secs(5),
        }
    }

    /// Host the requests are addressed to. With TLS and a server name set,
    /// that name is used and pinned to `address` by the client.
    fn host(&self) -> &str {
        match &self.tls_server_name {
            Some(name) if self.use_tls => name,
            _ => &self.address,
        }
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host(), self.http_port)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireToken {
    #[serde(rename = "AccessorID")]
    accessor_id: String,
    #[serde(default)]
    auth_method: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    partition: Option<String>,
}

impl From<WireToken> for MeshToken {
    fn from(w: WireToken) -> Self {
        MeshToken {
            accessor_id: w.accessor_id,
            auth_method: w.auth_method,
            description: w.description,
            create_time: w.create_time,
            namespace: w.namespace,
            partition: w.partition,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireService<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    service: &'a str,
    tags: &'a [String],
    meta: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireCheck<'a> {
    node: &'a str,
    #[serde(rename = "CheckID")]
    check_id: &'a str,
    name: &'a str,
    status: &'static str,
    output: &'a str,
    #[serde(rename = "ServiceID")]
    service_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireRegistration<'a> {
    node: &'a str,
    address: &'a str,
    service: WireService<'a>,
    checks: Vec<WireCheck<'a>>,
    skip_node_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireDeregistration<'a> {
    node: &'a str,
    #[serde(rename = "ServiceID")]
    service_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition: Option<&'a str>,
}

fn status_str(s: HealthStatus) -> &'static str {
    match s {
        HealthStatus::Passing => "passing",
        HealthStatus::Warning => "warning",
        HealthStatus::Critical => "critical",
    }
}

fn registration_body(reg: &MeshRegistration) -> WireRegistration<'_> {
    let ns = reg.placement.namespace.as_deref();
    WireRegistration {
        node: &reg.node,
        address: &reg.address,
        service: WireService {
            id: &reg.service_id,
            service: &reg.service_name,
            tags: &reg.tags,
            meta: &reg.meta,
            port: reg.port,
            namespace: ns,
            partition: reg.placement.partition.as_deref(),
        },
        checks: reg
            .checks
            .iter()
            .map(|c| WireCheck {
                node: &reg.node,
                check_id: &c.check_id,
                name: &c.name,
                status: status_str(c.status),
                output: &c.output,
                service_id: &reg.service_id,
                namespace: ns,
            })
            .collect(),
        skip_node_update: true,
        partition: reg.placement.partition.as_deref(),
    }
}

fn config_entry_body(entry: &ConfigEntry) -> serde_json::Value {
    let mut body = entry.payload.clone();
    body.insert("Kind".into(), entry.kind.clone().into());
    body.insert("Name".into(), entry.name.clone().into());
    if let Some(ns) = &entry.placement.namespace {
        body.insert("Namespace".into(), ns.clone().into());
    }
    if let Some(p) = &entry.placement.partition {
        body.insert("Partition".into(), p.clone().into());
    }
    serde_json::Value::Object(body)
}

/// Map a non-success response onto the error taxonomy.
pub(crate) fn status_error(status: StatusCode, body: &str) -> Error {
    let msg = format!("{status}: {}", body.trim());
    match status.as_u16() {
        401 | 403 => Error::permission_denied(msg),
        404 => Error::not_found(msg),
        408 | 429 | 500..=599 => Error::transient(msg),
        _ => Error::protocol(msg),
    }
}

fn send_error(e: reqwest::Error) -> Error {
    if e.is_decode() {
        Error::protocol(e.to_string())
    } else {
        // connect, timeout, reset mid-body
        Error::transient(e.to_string())
    }
}

/// Only a 404 proves the token is gone. Consul also answers 403 "ACL not
/// found" when the caller's own token is unknown.
fn already_gone(err: &Error) -> bool { err.is_not_found() }

pub struct HttpMeshClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    datacenter: Option<String>,
}

impl HttpMeshClient {
    pub fn new(conn: &MeshConnection) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(conn.api_timeout);
        if let Some(path) = &conn.ca_cert_file {
            let pem = std::fs::read(path).map_err(|e| Error::config(format!("reading CA file {}: {e}", path.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::config(format!("parsing CA file {}: {e}", path.display())))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(pem) = &conn.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| Error::config(format!("parsing inline CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if conn.host() != conn.address {
            let addr = (conn.address.as_str(), conn.http_port)
                .to_socket_addrs()
                .map_err(|e| Error::config(format!("resolving {}: {e}", conn.address)))?
                .next()
                .ok_or_else(|| Error::config(format!("{} resolved to no addresses", conn.address)))?;
            debug!(server_name = %conn.host(), %addr, "pinning TLS server name to mesh address");
            builder = builder.resolve(conn.host(), addr);
        }
        let http = builder.build().map_err(|e| Error::config(format!("building HTTP client: {e}")))?;
        Ok(Self { http, base: conn.base_url(), token: conn.token.clone(), datacenter: conn.datacenter.clone() })
    }

    fn request(&self, method: Method, path: &str, placement: &Placement) -> RequestBuilder {
        let mut rb = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(token) = &self.token {
            rb = rb.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.datacenter {
            rb = rb.query(&[("dc", dc)]);
        }
        if let Some(ns) = &placement.namespace {
            rb = rb.query(&[("ns", ns)]);
        }
        if let Some(p) = &placement.partition {
            rb = rb.query(&[("partition", p)]);
        }
        rb
    }

    async fn send(&self, op: &'static str, rb: RequestBuilder) -> Result<reqwest::Response> {
        metrics::counter!("mesh_api_requests_total", 1, "op" => op);
        let res = match rb.send().await {
            Ok(resp) if resp.status().is_success() => Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(status_error(status, &body))
            }
            Err(e) => Err(send_error(e)),
        };
        if let Err(e) = &res {
            metrics::counter!("mesh_api_errors_total", 1, "op" => op);
            debug!(op, error = %e, "mesh api call failed");
        }
        res
    }
}

#[async_trait::async_trait]
impl MeshApi for HttpMeshClient {
    async fn list_tokens(&self, query: &TokenQuery) -> Result<Vec<MeshToken>> {
        let rb = self
            .request(Method::GET, "/v1/acl/tokens", &query.placement)
            .query(&[("authmethod", query.auth_method.as_str()), ("consistent", "")]);
        let resp = self.send("list_tokens", rb).await?;
        let wire: Vec<WireToken> = resp.json().await.map_err(|e| Error::protocol(format!("decoding token list: {e}")))?;
        Ok(wire.into_iter().map(MeshToken::from).collect())
    }

    async fn revoke_token(&self, accessor_id: &str, placement: &Placement) -> Result<()> {
        let rb = self.request(Method::DELETE, &format!("/v1/acl/token/{accessor_id}"), placement);
        match self.send("revoke_token", rb).await {
            Ok(_) => Ok(()),
            Err(e) if already_gone(&e) => {
                debug!(accessor = %accessor_id, "token already revoked");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn register(&self, reg: &MeshRegistration) -> Result<()> {
        let rb = self.request(Method::PUT, "/v1/catalog/register", &Placement::default()).json(&registration_body(reg));
        self.send("register", rb).await.map(drop)
    }

    async fn deregister(&self, key: &RegistrationKey) -> Result<()> {
        let body = WireDeregistration {
            node: &key.node,
            service_id: &key.service_id,
            namespace: key.placement.namespace.as_deref(),
            partition: key.placement.partition.as_deref(),
        };
        let rb = self.request(Method::PUT, "/v1/catalog/deregister", &Placement::default()).json(&body);
        match self.send("deregister", rb).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(node = %key.node, service = %key.service_id, "deregister of unknown service");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_config_entry(&self, entry: &ConfigEntry) -> Result<()> {
        let rb = self.request(Method::PUT, "/v1/config", &Placement::default()).json(&config_entry_body(entry));
        self.send("set_config_entry", rb).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::{HealthCheck, WorkKey};

    #[test]
    fn status_codes_map_onto_taxonomy() {
        assert!(status_error(StatusCode::FORBIDDEN, "Permission denied").is_fatal());
        assert!(status_error(StatusCode::UNAUTHORIZED, "").is_fatal());
        assert!(status_error(StatusCode::NOT_FOUND, "").is_not_found());
        for code in [408u16, 429, 500, 503] {
            let e = status_error(StatusCode::from_u16(code).unwrap(), "");
            assert!(!e.is_fatal() && !e.is_not_found(), "{code}");
        }
        assert!(matches!(status_error(StatusCode::BAD_REQUEST, "bad"), Error::Protocol(_)));
    }

    #[test]
    fn only_not_found_counts_as_already_revoked() {
        assert!(already_gone(&status_error(StatusCode::NOT_FOUND, "")));
        assert!(!already_gone(&status_error(StatusCode::FORBIDDEN, "rpc error: ACL not found")));
        assert!(!already_gone(&status_error(StatusCode::FORBIDDEN, "Permission denied")));
    }

    #[test]
    fn registration_body_uses_catalog_field_names() {
        let mut reg = MeshRegistration::for_workload(&WorkKey::new("ns1", "web-0"), "node-1", "web", "web-0")
            .with_placement(Placement { namespace: Some("ns1".into()), partition: None });
        reg.address = "10.0.0.7".into();
        reg.port = Some(8080);
        reg.checks.push(HealthCheck {
            check_id: "web-0-ready".into(),
            name: "ready".into(),
            status: HealthStatus::Critical,
            output: "not ready".into(),
        });
        let v = serde_json::to_value(registration_body(&reg)).unwrap();
        assert_eq!(v["Node"], "node-1");
        assert_eq!(v["Service"]["ID"], "web-0");
        assert_eq!(v["Service"]["Port"], 8080);
        assert_eq!(v["Service"]["Namespace"], "ns1");
        assert_eq!(v["Service"]["Meta"]["pod-name"], "web-0");
        assert_eq!(v["Checks"][0]["Status"], "critical");
        assert_eq!(v["Checks"][0]["ServiceID"], "web-0");
        assert!(v.get("Partition").is_none());
    }

    #[test]
    fn config_entry_body_merges_kind_and_name() {
        let mut payload = serde_json::Map::new();
        payload.insert("DefaultSubset".into(), "v1".into());
        let entry = ConfigEntry {
            kind: "service-resolver".into(),
            name: "web".into(),
            payload,
            placement: Placement { namespace: None, partition: Some("ap1".into()) },
        };
        let v = config_entry_body(&entry);
        assert_eq!(v["Kind"], "service-resolver");
        assert_eq!(v["Name"], "web");
        assert_eq!(v["DefaultSubset"], "v1");
        assert_eq!(v["Partition"], "ap1");
        assert!(v.get("Namespace").is_none());
    }

    #[test]
    fn base_url_follows_tls_setting() {
        let mut c = MeshConnection::new("consul.svc");
        assert_eq!(c.base_url(), "http://consul.svc:8500");
        c.use_tls = true;
        c.http_port = 8501;
        assert_eq!(c.base_url(), "https://consul.svc:8501");
    }

    #[test]
    fn tls_server_name_replaces_the_host_only_with_tls() {
        let mut c = MeshConnection::new("127.0.0.1");
        c.tls_server_name = Some("server.dc1.consul".into());
        assert_eq!(c.base_url(), "http://127.0.0.1:8500");
        c.use_tls = true;
        assert_eq!(c.base_url(), "https://server.dc1.consul:8500");
        assert!(HttpMeshClient::new(&c).is_ok());
    }

    #[test]
    fn unreadable_inline_ca_is_a_config_error() {
        let mut c = MeshConnection::new("127.0.0.1");
        c.ca_cert_pem = Some("-----BEGIN CERTIFICATE-----\nnot base64!\n-----END CERTIFICATE-----\n".into());
        let err = HttpMeshClient::new(&c).err().unwrap();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }
}
