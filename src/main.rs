mod app;
mod config;
mod filter;
mod guard;
mod handlers;
mod http;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod rate_limit;
mod security;
mod store;
#[cfg(test)]
mod test_support;

use app::{AppState, build_router};
use config::AppConfig;
use eyre::WrapErr;
use guard::InFlightGuard;
use llm::{GenerationClient, LlmClient};
use metrics_exporter_prometheus::PrometheusBuilder;
use pipeline::Pipeline;
use rate_limit::RateLimiter;
use security::AdminAuth;
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryStore, PgStore, TaxonomyStore};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "syllabus.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let config = AppConfig::from_env();

    let store: Arc<dyn TaxonomyStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgStore::connect(url, config.database_max_connections)
                .await
                .wrap_err("connecting to DATABASE_URL")?,
        ),
        None => {
            warn!(
                target = "syllabus.store",
                "DATABASE_URL not set; using the in-memory store (data is lost on restart)"
            );
            Arc::new(MemoryStore::new())
        }
    };

    let redis = config
        .redis_url
        .as_deref()
        .and_then(|url| match redis::Client::open(url) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(target = "syllabus.guard", error = %err, "invalid REDIS_URL; using process-local guard and limiter");
                None
            }
        });
    let (guard, limiter) = match redis {
        Some(client) => (
            InFlightGuard::with_redis(client.clone(), config.guard_ttl),
            RateLimiter::with_redis(config.rate_limit, client),
        ),
        None => (InFlightGuard::local(), RateLimiter::new(config.rate_limit)),
    };

    let generator = GenerationClient::new(
        LlmClient::new(http::build_client(&config.http)),
        store.clone(),
        config.retry,
    );

    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| serde_json::json!({"openapi": "3.0.3"}));

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(target = "syllabus.metrics", error = %err, "prometheus recorder unavailable");
            None
        }
    };

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let state = AppState {
        pipeline: Pipeline::new(store, generator),
        guard,
        config: Arc::new(config),
        openapi: Arc::new(openapi),
        prometheus,
    };
    let app = build_router(state, limiter, AdminAuth::from_env());

    info!(target = "syllabus.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
