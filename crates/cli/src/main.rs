use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use meshsync_catalog::{CatalogSyncer, Syncer};
use meshsync_controller::{Reconciler, Runner, TokenReaper};
use meshsync_kubehub::{watch_workloads, KubeWorkloads};
use meshsync_mesh::HttpMeshClient;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod args;

use args::Args;

fn init_tracing() {
    let env = std::env::var("MESHSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<std::net::SocketAddr>) {
    if let Some(sock) = addr {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    init_metrics(args.metrics_addr);

    let cfg = args.reconciler_config().context("invalid controller configuration")?;
    let conn = args.mesh_connection()?;
    info!(
        release = %cfg.selector.release,
        auth_method = ?cfg.auth_method,
        mesh = %conn.base_url(),
        workers = cfg.workers,
        "starting meshsyncd"
    );

    let client = kube::Client::try_default().await.context("building kube client")?;
    let mesh = Arc::new(HttpMeshClient::new(&conn).context("building mesh client")?);
    let lookup_timeout = conn.api_timeout.max(Duration::from_secs(1));
    let workloads = Arc::new(KubeWorkloads::new(client.clone(), lookup_timeout));
    if cfg.auth_method.is_none() {
        warn!("no auth method configured; ACL token cleanup is disabled");
    }
    let reaper = TokenReaper::from_config(&cfg, mesh.clone(), workloads.clone());
    // Producers of desired registrations hand their sets to this handle.
    let catalog: Arc<dyn Syncer> = Arc::new(CatalogSyncer::new(mesh));
    let reconciler = Arc::new(Reconciler::new(workloads, reaper).with_catalog(catalog.clone()));
    let runner = Runner::new(&cfg, reconciler);

    let (tx, rx) = mpsc::channel(1024);
    let watcher = tokio::spawn({
        let selector = cfg.selector.label_selector();
        let ns = cfg.watch_namespace.clone();
        async move {
            if let Err(e) = watch_workloads(client, ns.as_deref(), &selector, tx).await {
                error!(error = ?e, "pod watcher failed");
            }
        }
    });

    let result = runner
        .run(rx, async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    watcher.abort();
    info!(registrations = catalog.registrations().len(), "catalog registrations at shutdown");
    result.context("controller stopped on a fatal error")
}
