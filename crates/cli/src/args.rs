use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{ArgAction, Parser};
use meshsync_core::{AdmissionFilter, ComponentSelector, NamespaceSet, PlacementConfig, ReconcilerConfig};
use meshsync_mesh::MeshConnection;

#[derive(Parser, Debug)]
#[command(name = "meshsyncd", version, about = "Revoke mesh ACL tokens and catalog entries of departed workloads")]
pub struct Args {
    /// Helm release whose controller pods are watched
    #[arg(long, env = "MESHSYNC_RELEASE_NAME")]
    pub release_name: String,

    /// Auth method whose login tokens are cleaned up; unset disables cleanup
    #[arg(long, env = "MESHSYNC_AUTH_METHOD")]
    pub auth_method: Option<String>,

    /// Cluster namespaces to act on (`*` for all)
    #[arg(long = "allow-k8s-namespace", value_delimiter = ',')]
    pub allow_namespaces: Vec<String>,

    #[arg(long = "deny-k8s-namespace", value_delimiter = ',')]
    pub deny_namespaces: Vec<String>,

    /// Only watch this namespace
    #[arg(long)]
    pub watch_namespace: Option<String>,

    #[arg(long, action = ArgAction::SetTrue)]
    pub enable_namespaces: bool,

    #[arg(long, env = "CONSUL_NAMESPACE", default_value = "default")]
    pub consul_destination_namespace: String,

    #[arg(long, action = ArgAction::SetTrue)]
    pub enable_k8s_namespace_mirroring: bool,

    #[arg(long, default_value = "")]
    pub k8s_namespace_mirroring_prefix: String,

    #[arg(long, action = ArgAction::SetTrue)]
    pub enable_partitions: bool,

    #[arg(long, env = "CONSUL_PARTITION", default_value = "default")]
    pub partition: String,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub reconcile_timeout: Duration,

    /// Interval of the cluster-wide token sweep
    #[arg(long, value_parser = parse_duration, default_value = "5m")]
    pub resync_interval: Duration,

    #[arg(long, default_value_t = 4)]
    pub revoke_concurrency: usize,

    /// Mesh server address; the first entry of a comma-separated list is used
    #[arg(long = "addresses", env = "CONSUL_ADDRESSES")]
    pub consul_addresses: String,

    #[arg(long = "http-port", env = "CONSUL_HTTP_PORT", default_value_t = 8500)]
    pub consul_http_port: u16,

    #[arg(long = "use-tls", env = "CONSUL_USE_TLS", action = ArgAction::Set, default_value_t = false)]
    pub consul_use_tls: bool,

    #[arg(long = "ca-cert-file", env = "CONSUL_CACERT_FILE")]
    pub consul_ca_cert_file: Option<PathBuf>,

    #[arg(long = "ca-cert-pem", env = "CONSUL_CACERT_PEM", hide_env_values = true)]
    pub consul_ca_cert_pem: Option<String>,

    /// Server name checked against the mesh certificate
    #[arg(long = "tls-server-name", env = "CONSUL_TLS_SERVER_NAME")]
    pub consul_tls_server_name: Option<String>,

    #[arg(long = "token", env = "CONSUL_ACL_TOKEN", hide_env_values = true)]
    pub consul_token: Option<String>,

    #[arg(long = "datacenter", env = "CONSUL_DATACENTER")]
    pub consul_datacenter: Option<String>,

    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub api_timeout: Duration,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "MESHSYNC_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// `500ms`, `30s`, `5m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || anyhow!("invalid duration '{s}', expected e.g. 500ms, 30s, 5m, 1h");
    let (digits, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1000)
    } else {
        (s, 1000)
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    n.checked_mul(unit_ms).map(Duration::from_millis).ok_or_else(invalid)
}

impl Args {
    pub fn reconciler_config(&self) -> Result<ReconcilerConfig> {
        let mut cfg = ReconcilerConfig::new(ComponentSelector::new(&self.release_name));
        cfg.auth_method = self.auth_method.clone().filter(|m| !m.is_empty());
        cfg.admission = AdmissionFilter::new(
            self.allow_namespaces.iter().collect::<NamespaceSet>(),
            self.deny_namespaces.iter().collect::<NamespaceSet>(),
        );
        cfg.placement = PlacementConfig {
            enable_namespaces: self.enable_namespaces,
            destination_namespace: self.consul_destination_namespace.clone(),
            mirroring_prefix: self.enable_k8s_namespace_mirroring.then(|| self.k8s_namespace_mirroring_prefix.clone()),
            enable_partitions: self.enable_partitions,
            partition: self.partition.clone(),
        };
        cfg.watch_namespace = self.watch_namespace.clone();
        cfg.workers = self.workers;
        cfg.reconcile_timeout = self.reconcile_timeout;
        cfg.resync_interval = self.resync_interval;
        cfg.revoke_concurrency = self.revoke_concurrency;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn mesh_connection(&self) -> Result<MeshConnection> {
        let Some(address) = self.consul_addresses.split(',').map(str::trim).find(|a| !a.is_empty()) else {
            bail!("no mesh server address given");
        };
        let mut conn = MeshConnection::new(address);
        conn.http_port = self.consul_http_port;
        conn.use_tls = self.consul_use_tls;
        conn.ca_cert_file = self.consul_ca_cert_file.clone();
        conn.ca_cert_pem = self.consul_ca_cert_pem.clone().filter(|p| !p.trim().is_empty());
        conn.tls_server_name = self.consul_tls_server_name.clone().filter(|n| !n.is_empty());
        conn.token = self.consul_token.clone().filter(|t| !t.is_empty());
        conn.datacenter = self.consul_datacenter.clone().filter(|d| !d.is_empty());
        conn.api_timeout = self.api_timeout;
        Ok(conn)
    }
}
