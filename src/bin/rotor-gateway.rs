use std::sync::Arc;

use tracing::info;

use rotor_llm::config::GatewayConfig;
use rotor_llm::gate::ConcurrencyGate;
use rotor_llm::http::auth::{AdminAuth, PrincipalDirectory};
use rotor_llm::http::AppState;
use rotor_llm::pool::{KeyPool, PoolSettings};
use rotor_llm::proxy::ProxyEngine;
use rotor_llm::store::Store;
use rotor_llm::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .ok_or("usage: rotor-gateway <config.json> [--listen HOST:PORT]")?;
    let mut listen = "127.0.0.1:8080".to_string();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let raw = std::fs::read_to_string(&config_path)?;
    let config: GatewayConfig = serde_json::from_str(&raw)?;
    info!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Store::open(&config.database_path)?;
    let pool = KeyPool::load(store.clone(), PoolSettings::from_config(&config)).await?;
    let _sweeper = pool.spawn_sweeper();

    let config = Arc::new(config);
    let engine = ProxyEngine {
        config: Arc::clone(&config),
        store: store.clone(),
        pool,
        gate: ConcurrencyGate::new(config.max_concurrent_upstream, config.acquire_timeout()),
        upstream: UpstreamClient::from_config(&config)?,
    };
    let state = AppState {
        principals: PrincipalDirectory::load(&store).await?,
        admin: AdminAuth::from_config(&config),
        engine,
    };

    let app = rotor_llm::http::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(%listen, "rotor-gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
