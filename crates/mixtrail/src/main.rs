mod cli;
mod server;

use std::sync::Arc;

use clap::Parser;
use eyre::{eyre, WrapErr};

use mixtrail_core::cache::TxCache;
use mixtrail_core::config::Config;
use mixtrail_core::detect::Classifier;
use mixtrail_core::engine::Engine;
use mixtrail_core::explorer::{EsploraClient, Explorer};
use mixtrail_core::monitor::MempoolMonitor;
use mixtrail_core::store::{CypherHttpStore, GraphStore};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .map_err(|e| eyre!(e.to_string()))
            .wrap_err("load configuration file")?,
        None => Config::default(),
    };
    args.apply(&mut config);

    // Connect to the graph store and verify connectivity before starting
    // the server.
    let store = CypherHttpStore::new(&config.store);
    let health = store.probe().await.map_err(|err| {
        let message = format_store_connect_error(&config.store.uri, &err.to_string());
        eyre!(message).wrap_err("while attempting to connect to the graph store")
    })?;
    tracing::info!(
        transactions = health.transaction_count,
        addresses = health.address_count,
        "connected to graph store"
    );
    let store: Arc<dyn GraphStore> = Arc::new(store);

    let explorer: Arc<dyn Explorer> = Arc::new(
        EsploraClient::new(&config.explorer).map_err(|e| eyre!(e.to_string()))?,
    );
    tracing::info!(base_url = %config.explorer.base_url, "explorer client ready");

    let cache = Arc::new(TxCache::from_config(&config.cache));
    let classifier = Arc::new(
        Classifier::from_config(&config.classifier).map_err(|e| eyre!(e.to_string()))?,
    );
    if classifier.ml_available() {
        tracing::info!("classifier running with heuristic + ml detectors");
    } else {
        tracing::info!("classifier running heuristic-only (no ml model configured)");
    }

    let engine = Arc::new(Engine::new(
        Arc::clone(&explorer),
        Arc::clone(&cache),
        Arc::clone(&classifier),
        Arc::clone(&store),
        &config.tracer,
        &config.server,
    ));

    let monitor = Arc::new(MempoolMonitor::new(
        explorer,
        cache,
        classifier,
        store,
        config.tracer.limits(),
        config.tracer.fetch_concurrency,
        &config.monitor,
    ));
    if args.monitor {
        monitor.start();
        tracing::info!("mempool monitor started at boot");
    }

    let bind_addr = format!("{}:{}", config.server.bind, config.server.port);
    let origin = format!("http://{bind_addr}");
    let state = server::AppState {
        engine,
        monitor: Arc::clone(&monitor),
    };
    let router = server::build_router(state, &origin);

    if config.server.bind == "0.0.0.0" {
        tracing::warn!("server is bound to 0.0.0.0 — it is accessible from the network");
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .wrap_err("bind TCP listener")?;

    tracing::info!("listening on {bind_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(monitor))
        .await
        .wrap_err("run HTTP server")?;

    Ok(())
}

/// Wait for SIGINT, then stop the monitor so workers drain before the
/// server exits.
async fn shutdown_signal(monitor: Arc<MempoolMonitor>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("shutdown signal received");
    monitor.stop();
}

fn format_store_connect_error(store_uri: &str, source_error: &str) -> String {
    let mut lines = vec![
        format!("could not connect to graph store `{store_uri}`"),
        format!("store error: {source_error}"),
    ];

    if source_error.contains("Could not resolve host") || source_error.contains("dns error") {
        lines.push(
            "hint: hostname resolution failed; verify the store hostname and your DNS/network"
                .into(),
        );
    } else if source_error.contains("Unauthorized") || source_error.contains("401") {
        lines.push("hint: authentication failed; verify --store-user/--store-pass".into());
    } else if source_error.contains("404") {
        lines.push(
            "hint: endpoint path is invalid; verify the store URI and database name".into(),
        );
    } else if source_error.contains("error sending request for url") {
        lines.push(
            "hint: request could not be sent; verify URI format, network access, and that the store is running"
                .into(),
        );
    }

    lines.join("\n")
}
