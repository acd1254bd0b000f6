// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{series, start_proxy};
use governance_proxy::config::{EvictionMode, GovernanceConfig, ProxyConfig};
use governance_proxy::hash::{select_endpoint, shard_of};
use governance_proxy::series::compress_write_request;
use mockito::Server;
use serde_json::json;

fn config(endpoints: Vec<String>) -> ProxyConfig {
    ProxyConfig {
        remote_write_urls: endpoints,
        batch_size: 1_000,
        release_after_seconds: 60,
        ..ProxyConfig::default()
    }
}

#[tokio::test]
async fn proxy_forwards_remote_write_to_downstream() {
    let mut downstream = Server::new_async().await;
    let mock = downstream
        .mock("POST", "/api/v1/write")
        .match_header("Content-Encoding", "snappy")
        .match_header("Content-Type", "application/x-protobuf")
        .match_header("X-Prometheus-Remote-Write-Version", "0.1.0")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let proxy = start_proxy(config(vec![format!(
        "{}/api/v1/write",
        downstream.url()
    )]))
    .await;

    let body = compress_write_request(&[
        series("http_requests_total", &[("path", "/a")]),
        series("http_requests_total", &[("path", "/b")]),
    ])
    .unwrap();
    let response = reqwest::Client::new()
        .post(proxy.url("/write"))
        .header("Content-Encoding", "snappy")
        .header("Content-Type", "application/x-protobuf")
        .body(body)
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status().as_u16(), 204);

    let stats = proxy.stats.clone();
    proxy.stop().await;

    mock.assert_async().await;
    let snapshot = stats.peek();
    assert_eq!(snapshot.processed_metrics, 2);
    assert_eq!(snapshot.failed_dispatches, 0);
    assert!(snapshot.processed_bytes > 0);
}

#[tokio::test]
async fn proxy_routes_each_metric_to_one_endpoint() {
    let mut first = Server::new_async().await;
    let mut second = Server::new_async().await;
    let endpoints = vec![
        format!("{}/write", first.url()),
        format!("{}/write", second.url()),
    ];

    let names = [
        "cpu_seconds_total",
        "memory_bytes",
        "http_requests_total",
        "up",
        "disk_io_bytes_total",
        "go_goroutines",
    ];
    let per_endpoint = |endpoint: &str| {
        names
            .iter()
            .filter(|name| select_endpoint(shard_of(name), &endpoints) == Some(endpoint))
            .count()
    };
    let first_mock = first
        .mock("POST", "/write")
        .with_status(204)
        .expect(per_endpoint(&endpoints[0]))
        .create_async()
        .await;
    let second_mock = second
        .mock("POST", "/write")
        .with_status(204)
        .expect(per_endpoint(&endpoints[1]))
        .create_async()
        .await;

    let proxy = start_proxy(config(endpoints.clone())).await;
    let client = reqwest::Client::new();
    for round in 0..3 {
        let batch: Vec<_> = names
            .iter()
            .map(|name| series(name, &[("round", &round.to_string())]))
            .collect();
        let response = client
            .post(proxy.url("/write"))
            .body(compress_write_request(&batch).unwrap())
            .send()
            .await
            .expect("request failed");
        assert_eq!(response.status().as_u16(), 204);
    }
    proxy.stop().await;

    // one batch per metric, all rounds of a metric in the same batch
    first_mock.assert_async().await;
    second_mock.assert_async().await;
}

#[tokio::test]
async fn proxy_enforces_cardinality_limit() {
    let mut downstream = Server::new_async().await;
    let mock = downstream
        .mock("POST", "/write")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let proxy = start_proxy(ProxyConfig {
        cardinality_limit: GovernanceConfig {
            enabled: true,
            capacity: 10,
            limit: 2,
            mode: EvictionMode::DropTag,
            max_tags: 100,
        },
        ..config(vec![format!("{}/write", downstream.url())])
    })
    .await;

    let body = compress_write_request(&[
        series("rpc_calls", &[("method", "Get"), ("user", "1")]),
        series("rpc_calls", &[("method", "Get"), ("user", "2")]),
        series("rpc_calls", &[("method", "Get"), ("user", "3")]),
    ])
    .unwrap();
    let client = reqwest::Client::new();
    let response = client
        .post(proxy.url("/write"))
        .body(body)
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status().as_u16(), 204);

    let cardinality = client
        .get(proxy.url("/metrics_cardinality"))
        .send()
        .await
        .expect("request failed")
        .text()
        .await
        .expect("invalid body");
    let cardinality: serde_json::Value =
        serde_json::from_str(&cardinality).expect("invalid json");
    assert_eq!(cardinality, json!({ "metrics": { "rpc_calls": { "method": 1 } } }));

    let metrics = client
        .get(proxy.url("/metrics"))
        .send()
        .await
        .expect("request failed")
        .text()
        .await
        .expect("invalid body");
    assert!(metrics.contains("governance_proxy_dropped_tags_total 1"));
    assert!(metrics.contains("governance_proxy_tracked_metrics 1"));

    let stats = proxy.stats.clone();
    proxy.stop().await;
    mock.assert_async().await;
    assert_eq!(stats.peek().processed_metrics, 3);
}

#[tokio::test]
async fn proxy_rejects_bad_requests() {
    let proxy = start_proxy(config(vec!["http://127.0.0.1:1/write".to_string()])).await;
    let client = reqwest::Client::new();

    let response = client
        .get(proxy.url("/write"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status().as_u16(), 405);

    let response = client
        .post(proxy.url("/write"))
        .body("plain text is not a remote write request")
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status().as_u16(), 400);

    let response = client
        .get(proxy.url("/unknown"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status().as_u16(), 404);

    proxy.stop().await;
}
