// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::PathBuf, process, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use governance_proxy::{
    batcher::{BatcherConfig, WorkerPool},
    cardinality::CardinalityTracker,
    config::ProxyConfig,
    dispatcher::{Dispatcher, RemoteWriteDispatcher},
    server::ProxyServer,
    stats::{report_periodically, Stats},
};

const DEFAULT_CONFIG_FILE: &str = "config.yml";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("GOVERNANCE_PROXY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config_path = env::var("GOVERNANCE_PROXY_CONFIG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = match ProxyConfig::load(&config_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Error loading configuration from {}: {e}", config_path.display());
            process::exit(1);
        }
    };

    let dispatcher = match RemoteWriteDispatcher::new(config.dispatch_timeout()) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!("Error creating remote write client: {e}");
            process::exit(1);
        }
    };

    let listener = match TcpListener::bind(config.listen_address).await {
        Ok(l) => l,
        Err(e) => {
            error!("Unable to listen on {}: {e}", config.listen_address);
            process::exit(1);
        }
    };

    let stats = Arc::new(Stats::new());
    let (queue, pool) = WorkerPool::start(
        &BatcherConfig::from(&*config),
        dispatcher as Arc<dyn Dispatcher>,
        Arc::clone(&stats),
    );
    let tracker = Arc::new(CardinalityTracker::new(
        config.cardinality_limit.clone(),
        Arc::clone(&stats),
    ));

    let cancel_token = CancellationToken::new();
    let reporter = tokio::spawn(report_periodically(
        Arc::clone(&stats),
        config.stats_interval(),
        cancel_token.clone(),
    ));

    info!(
        "Forwarding to {} endpoint(s), cardinality governance {}",
        config.remote_write_urls.len(),
        if config.cardinality_limit.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    let server = Arc::new(ProxyServer::new(
        Arc::clone(&config),
        queue,
        tracker,
        Arc::clone(&stats),
    ));
    let mut serve = tokio::spawn(server.serve(listener, cancel_token.clone()));

    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Unable to listen for shutdown signal: {e}");
            }
            info!("Shutting down");
            cancel_token.cancel();
            serve.await
        }
        result = &mut serve => {
            cancel_token.cancel();
            result
        }
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server stopped with error: {e}"),
        Err(e) => error!("Server task failed: {e}"),
    }

    pool.shutdown().await;
    if let Err(e) = reporter.await {
        error!("Stats reporter failed: {e}");
    }
}
