// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use serde_json::json;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{WorkItem, WorkQueue};
use crate::cardinality::{CardinalityTracker, Verdict};
use crate::config::ProxyConfig;
use crate::http_utils::{
    empty_response, json_response, log_and_create_http_response, text_response,
    verify_request_content_length, HttpResponse,
};
use crate::series::decode_write_request;
use crate::stats::Stats;

pub const WRITE_ENDPOINT_PATH: &str = "/write";
pub const CARDINALITY_ENDPOINT_PATH: &str = "/metrics_cardinality";
pub const METRICS_ENDPOINT_PATH: &str = "/metrics";

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// HTTP ingress: decodes remote-write requests, runs cardinality governance and hands the
/// surviving series to the work queue.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    queue: WorkQueue,
    tracker: Arc<CardinalityTracker>,
    stats: Arc<Stats>,
    endpoints: Arc<[String]>,
}

impl ProxyServer {
    #[must_use]
    pub fn new(
        config: Arc<ProxyConfig>,
        queue: WorkQueue,
        tracker: Arc<CardinalityTracker>,
        stats: Arc<Stats>,
    ) -> Self {
        let endpoints: Arc<[String]> = Arc::from(config.remote_write_urls.clone());
        ProxyServer {
            config,
            queue,
            tracker,
            stats,
            endpoints,
        }
    }

    /// Accepts connections on `listener` until `cancel_token` is cancelled, then closes every
    /// open connection. The server, and with it its handle on the work queue, is dropped on
    /// return.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel_token: CancellationToken,
    ) -> io::Result<()> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();
        info!("Listening on {}", listener.local_addr()?);

        loop {
            let conn = tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!("Server shutting down");
                    break;
                }
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        joinset.shutdown().await;
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };

            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let proxy = Arc::clone(&self);
            let service = service_fn(move |req| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.handle(req).await }
            });
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }

        joinset.shutdown().await;
        Ok(())
    }

    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, WRITE_ENDPOINT_PATH) => self.write_handler(req).await,
            (_, WRITE_ENDPOINT_PATH) => log_and_create_http_response(
                &format!("Method {} not allowed on {WRITE_ENDPOINT_PATH}", req.method()),
                StatusCode::METHOD_NOT_ALLOWED,
            ),
            (&Method::GET, CARDINALITY_ENDPOINT_PATH) => self.cardinality_handler(),
            (&Method::GET, METRICS_ENDPOINT_PATH) => self.metrics_handler(),
            _ => empty_response(StatusCode::NOT_FOUND),
        }
    }

    async fn write_handler<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let now = Instant::now();
        let max_content_length = self.config.max_request_content_length;
        if let Some(response) = verify_request_content_length(
            req.headers(),
            max_content_length,
            "Error processing write request",
        ) {
            return response;
        }

        let body = match Limited::new(req.into_body(), max_content_length)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return log_and_create_http_response(
                    "Error processing write request: Payload too large",
                    StatusCode::PAYLOAD_TOO_LARGE,
                );
            }
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error reading request body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let request = match decode_write_request(&body) {
            Ok(request) => request,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error decoding write request: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let received = request.timeseries.len();
        let mut accepted = 0;
        for mut series in request.timeseries {
            match self.tracker.govern(&mut series) {
                Verdict::MissingName => {
                    warn!("Discarding series without a metric name");
                    self.stats.record_rejected();
                }
                Verdict::Drop => {}
                Verdict::Retain { .. } => {
                    let item = WorkItem {
                        series,
                        endpoints: Arc::clone(&self.endpoints),
                        debug: self.config.debug,
                    };
                    if let Err(e) = self.queue.submit(item).await {
                        return log_and_create_http_response(
                            &format!("Error queueing series: {e}"),
                            StatusCode::SERVICE_UNAVAILABLE,
                        );
                    }
                    accepted += 1;
                }
            }
        }

        debug!(
            "Accepted {accepted} of {received} series in {} ms",
            now.elapsed().as_millis()
        );
        empty_response(StatusCode::NO_CONTENT)
    }

    fn cardinality_handler(&self) -> http::Result<HttpResponse> {
        let snapshot = self.tracker.snapshot(self.config.json_min_cardinality);
        json_response(json!({ "metrics": snapshot }).to_string())
    }

    fn metrics_handler(&self) -> http::Result<HttpResponse> {
        self.stats
            .set_tracked_metrics(self.tracker.tracked_metrics());
        match self.stats.encode_openmetrics() {
            Ok(body) => text_response(body, OPENMETRICS_CONTENT_TYPE),
            Err(e) => log_and_create_http_response(
                &format!("Error encoding metrics: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatcherConfig, WorkerPool};
    use crate::config::{EvictionMode, GovernanceConfig};
    use crate::dispatcher::Dispatcher;
    use crate::errors::DispatchError;
    use crate::series::{compress_write_request, Label, Sample, TimeSeries};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::header;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDispatcher {
        series: StdMutex<Vec<TimeSeries>>,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            _endpoint: &str,
            batch: &[TimeSeries],
            _debug: bool,
        ) -> Result<(), DispatchError> {
            self.series.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }
    }

    struct Harness {
        server: ProxyServer,
        pool: WorkerPool,
        dispatcher: Arc<RecordingDispatcher>,
        stats: Arc<Stats>,
    }

    fn harness(governance: GovernanceConfig) -> Harness {
        let config = Arc::new(ProxyConfig {
            remote_write_urls: vec!["http://prom:9090/api/v1/write".to_string()],
            max_request_content_length: 4096,
            json_min_cardinality: 2,
            cardinality_limit: governance.clone(),
            ..ProxyConfig::default()
        });
        let stats = Arc::new(Stats::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let (queue, pool) = WorkerPool::start(
            &BatcherConfig {
                batch_size: 1_000,
                release_after: Duration::from_secs(60),
                ..BatcherConfig::from(&*config)
            },
            Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
            Arc::clone(&stats),
        );
        let tracker = Arc::new(CardinalityTracker::new(governance, Arc::clone(&stats)));
        let server = ProxyServer::new(config, queue, tracker, Arc::clone(&stats));
        Harness {
            server,
            pool,
            dispatcher,
            stats,
        }
    }

    fn series(name: &str, labels: &[(&str, &str)]) -> TimeSeries {
        let mut all = vec![Label::new("__name__", name)];
        all.extend(labels.iter().map(|(k, v)| Label::new(*k, *v)));
        TimeSeries {
            labels: all,
            samples: vec![Sample {
                value: 1.0,
                timestamp: 1_700_000_000_000,
            }],
        }
    }

    fn write_request(body: Vec<u8>) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(WRITE_ENDPOINT_PATH)
            .header(header::CONTENT_LENGTH, body.len().to_string())
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_write_forwards_governed_series() {
        let Harness {
            server,
            pool,
            dispatcher,
            stats,
        } = harness(GovernanceConfig::default());

        let body = compress_write_request(&[
            series("up", &[("job", "node")]),
            TimeSeries {
                labels: vec![Label::new("job", "node")],
                samples: vec![],
            },
        ])
        .unwrap();
        let response = server.handle(write_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        drop(server);
        pool.shutdown().await;
        assert_eq!(
            *dispatcher.series.lock().unwrap(),
            vec![series("up", &[("job", "node")])]
        );
        assert_eq!(stats.peek().processed_metrics, 1);
        assert!(stats
            .encode_openmetrics()
            .unwrap()
            .contains("governance_proxy_rejected_records_total 1"));
    }

    #[tokio::test]
    async fn test_write_drops_series_over_the_limit() {
        let Harness {
            server,
            pool,
            dispatcher,
            stats,
        } = harness(GovernanceConfig {
            enabled: true,
            capacity: 10,
            limit: 1,
            mode: EvictionMode::DropMetric,
            max_tags: 100,
        });

        let body = compress_write_request(&[
            series("http_requests_total", &[("path", "/a")]),
            series("http_requests_total", &[("path", "/b")]),
        ])
        .unwrap();
        let response = server.handle(write_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        drop(server);
        pool.shutdown().await;
        assert_eq!(dispatcher.series.lock().unwrap().len(), 1);
        assert_eq!(stats.peek().dropped_metrics, 1);
    }

    #[tokio::test]
    async fn test_write_rejects_invalid_body() {
        let harness = harness(GovernanceConfig::default());

        let response = harness
            .server
            .handle(write_request(b"not a snappy payload".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response)
            .await
            .contains("Error decoding write request"));
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_body() {
        let harness = harness(GovernanceConfig::default());

        let response = harness
            .server
            .handle(write_request(vec![0; 8192]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_write_requires_post() {
        let harness = harness(GovernanceConfig::default());

        let response = harness.server.handle(get(WRITE_ENDPOINT_PATH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = harness.server.handle(get("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cardinality_endpoint_filters_by_min_cardinality() {
        let harness = harness(GovernanceConfig::default());

        let body = compress_write_request(&[
            series("http_requests_total", &[("path", "/a"), ("method", "GET")]),
            series("http_requests_total", &[("path", "/b"), ("method", "GET")]),
            series("up", &[("job", "node")]),
        ])
        .unwrap();
        harness.server.handle(write_request(body)).await.unwrap();

        let response = harness
            .server
            .handle(get(CARDINALITY_ENDPOINT_PATH))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body,
            json!({ "metrics": { "http_requests_total": { "path": 2 } } })
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint_reports_tracked_metrics() {
        let harness = harness(GovernanceConfig::default());

        let body = compress_write_request(&[
            series("a", &[("l", "1")]),
            series("b", &[("l", "1")]),
        ])
        .unwrap();
        harness.server.handle(write_request(body)).await.unwrap();

        let response = harness.server.handle(get(METRICS_ENDPOINT_PATH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            OPENMETRICS_CONTENT_TYPE
        );
        let text = body_string(response).await;
        assert!(text.contains("governance_proxy_tracked_metrics 2"));
    }
}
