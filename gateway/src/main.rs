//! Standalone bastion gateway binary: config -> tracing -> router -> listener.

use std::str::FromStr;
use std::sync::Arc;

use bastion_core::config;
use bastion_core::monitor::MonitorBus;
use bastion_core::rdp_proxy::RdpProxy;
use bastion_core::ssh_proxy::SshProxy;
use bastion_gateway::stores::{EnvSecretStore, InMemoryTargetStore, SqliteAuditStore};
use bastion_gateway::AppState;
use tokio_util::sync::CancellationToken;

fn main() -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = config::ensure_loaded().map_err(|e| anyhow::anyhow!(e))?;

    let monitor = MonitorBus::new();
    let ssh_proxy = Arc::new(SshProxy::new(
        monitor.clone(),
        Some(cfg.recordings_dir.clone()),
        cfg.known_hosts_path.clone(),
        std::time::Duration::from_secs(cfg.ssh_connect_timeout_secs),
    ));
    let rdp_proxy = Arc::new(RdpProxy::new(
        monitor.clone(),
        Some(cfg.recordings_dir.clone()),
        cfg.rendering_daemon_addr.clone(),
    ));

    let audit_store = SqliteAuditStore::open(&cfg.audit_db_path)?;

    let state = AppState {
        target_store: Arc::new(InMemoryTargetStore::new()),
        secret_store: Arc::new(EnvSecretStore),
        audit_store: Arc::new(audit_store),
        monitor,
        ssh_proxy,
        rdp_proxy,
        shutdown: CancellationToken::new(),
    };

    let addr = std::net::SocketAddr::from_str(&cfg.listen_addr)?;
    let app = bastion_gateway::router(state);
    bastion_gateway::serve(addr, app).await
}
