// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use governance_proxy::{
    batcher::{BatcherConfig, WorkerPool},
    cardinality::CardinalityTracker,
    config::ProxyConfig,
    dispatcher::{Dispatcher, RemoteWriteDispatcher},
    series::{Label, Sample, TimeSeries},
    server::ProxyServer,
    stats::Stats,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A proxy listening on an ephemeral local port, forwarding with the real HTTP dispatcher.
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
    cancel_token: CancellationToken,
    server_handle: JoinHandle<std::io::Result<()>>,
    pool: WorkerPool,
}

impl RunningProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Stops accepting requests and waits until every batched series has been dispatched.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        self.server_handle
            .await
            .expect("server task panicked")
            .expect("server failed");
        self.pool.shutdown().await;
    }
}

pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let config = Arc::new(config);
    let stats = Arc::new(Stats::new());
    let dispatcher = RemoteWriteDispatcher::new(Duration::from_secs(2))
        .expect("failed to build dispatcher");
    let (queue, pool) = WorkerPool::start(
        &BatcherConfig::from(&*config),
        Arc::new(dispatcher) as Arc<dyn Dispatcher>,
        Arc::clone(&stats),
    );
    let tracker = Arc::new(CardinalityTracker::new(
        config.cardinality_limit.clone(),
        Arc::clone(&stats),
    ));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind listener");
    let addr = listener.local_addr().expect("failed to read local address");
    let server = Arc::new(ProxyServer::new(config, queue, tracker, Arc::clone(&stats)));
    let cancel_token = CancellationToken::new();
    let server_handle = tokio::spawn(server.serve(listener, cancel_token.clone()));

    RunningProxy {
        addr,
        stats,
        cancel_token,
        server_handle,
        pool,
    }
}

/// Create a test series with one sample
pub fn series(name: &str, labels: &[(&str, &str)]) -> TimeSeries {
    let mut all = vec![Label::new("__name__", name)];
    all.extend(labels.iter().map(|(k, v)| Label::new(*k, *v)));
    TimeSeries {
        labels: all,
        samples: vec![Sample {
            value: 42.0,
            timestamp: 1_700_000_000_000,
        }],
    }
}
