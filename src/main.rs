mod actions;
mod analyzer;
mod config;
mod control;
mod credentials;
mod domain;
mod error;
mod intake;
mod processors;
mod quarantine;
mod renderer;
mod rerun;
mod routes;
mod store;
mod telemetry;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use analyzer::FlakeAnalyzer;
use config::AppConfig;
use control::ControlState;
use credentials::{CredentialBroker, ReqwestTokenMinter};
use intake::ratelimit::TokenBucketLimiter;
use intake::ActionDispatchSender;
use processors::{NameProxyExtractor, ProcessorContext};
use rerun::RerunController;
use store::postgres::PostgresStore;
use store::Store;
use upstream::{GitHubUpstreamClient, UpstreamClient};

const GITHUB_API_BASE: &str = "https://api.github.com";
const INTAKE_WORKER_COUNT: usize = 5;
const INTAKE_QUEUE_CAPACITY: usize = 256;
const ACTION_DISPATCH_WORKER_COUNT: usize = 3;
const ACTION_DISPATCH_QUEUE_CAPACITY: usize = 64;

async fn root() -> &'static str {
    "FlakeGuard"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast on a missing webhook secret.
    let _ = config::WEBHOOK_SECRET.as_str();

    let app_config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&app_config.database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool));
    let upstream: Arc<dyn UpstreamClient> = Arc::new(GitHubUpstreamClient::new(GITHUB_API_BASE)?);
    let minter = Arc::new(ReqwestTokenMinter::new(reqwest::Client::new(), GITHUB_API_BASE));
    let credentials = Arc::new(CredentialBroker::new(app_config.credentials.clone(), minter));
    let analyzer = Arc::new(FlakeAnalyzer::new(store.clone(), app_config.analyzer));
    let rerun = Arc::new(RerunController::new(store.clone(), *config::RERUN_CEILING));
    let limiter = Arc::new(TokenBucketLimiter::default());

    let processor_ctx = Arc::new(ProcessorContext {
        store: store.clone(),
        upstream: upstream.clone(),
        credentials: credentials.clone(),
        analyzer: analyzer.clone(),
        rerun: rerun.clone(),
        extractor: Arc::new(NameProxyExtractor),
        host: "github.com".to_string(),
    });

    let (worker_tx, worker_rx) = mpsc::channel(INTAKE_QUEUE_CAPACITY);
    intake::spawn_intake_workers(INTAKE_WORKER_COUNT, worker_rx, processor_ctx.clone());

    // A separate, smaller pool for check_run.action_requested deliveries, so
    // a maintainer clicking "Quarantine" or "Rerun" isn't stuck behind a
    // backlog of routine workflow_run/workflow_job intake.
    let (action_tx, action_rx) = mpsc::channel(ACTION_DISPATCH_QUEUE_CAPACITY);
    intake::spawn_intake_workers(ACTION_DISPATCH_WORKER_COUNT, action_rx, processor_ctx);

    let control_state = ControlState {
        store: store.clone(),
        upstream: upstream.clone(),
        credentials: credentials.clone(),
        analyzer: analyzer.clone(),
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();

    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(routes::webhook_routes())
        .nest("/api", routes::api_routes())
        .layer(prometheus_layer)
        .layer(Extension(store))
        .layer(Extension(limiter))
        .layer(Extension(worker_tx))
        .layer(Extension(ActionDispatchSender(action_tx)))
        .layer(Extension(control_state));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    Ok(())
}
