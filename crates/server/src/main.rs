use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use sqaaas_common::config::{read_secret, ApiConfig};
use sqaaas_common::store::PipelineStore;
use sqaaas_server::badgr::BadgrGateway;
use sqaaas_server::github::GithubGateway;
use sqaaas_server::jenkins::JenkinsGateway;
use sqaaas_server::{AppState, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "sqaaas-api", about = "SQAaaS pipeline orchestration API")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "/etc/sqaaas/sqaaas.toml", env = "SQAAAS_CONFIG")]
    config: PathBuf,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "SQAAAS_LISTEN")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ApiConfig::load(&args.config)?;
    let timeout = Duration::from_secs(config.limits.request_timeout_secs);
    let mirror_timeout = Duration::from_secs(config.limits.mirror_timeout_secs);

    let repo_token = read_secret(&config.repository.token_path)?;
    let ci_token = read_secret(&config.ci.token_path)?;
    let badge_password = read_secret(&config.badge.password_path)?;

    let store = Arc::new(PipelineStore::new(config.store.db_file.clone()));
    let repo = Arc::new(GithubGateway::new(&repo_token, timeout, mirror_timeout)?);
    let ci = Arc::new(JenkinsGateway::new(
        &config.ci.endpoint,
        &config.ci.user,
        &ci_token,
        timeout,
    )?);
    let badge = Arc::new(BadgrGateway::new(
        &config.badge.endpoint,
        &config.badge.user,
        &badge_password,
        &config.badge.issuer,
        &config.badge.badgeclass,
        timeout,
    )?);

    info!(
        "Starting SQAaaS API (repository backend: {}, CI endpoint: {})",
        config.repository.backend, config.ci.endpoint
    );

    let orchestrator = Orchestrator::new(config, store, repo, ci, badge);
    sqaaas_server::serve(args.listen, Arc::new(AppState { orchestrator })).await
}
