// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::DispatchError;
use crate::series::{compress_write_request, TimeSeries};

pub const REMOTE_WRITE_VERSION_HEADER: &str = "X-Prometheus-Remote-Write-Version";
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Delivers one batch to `endpoint` as a single remote-write request. Failures are reported
    /// to the caller and never retried.
    async fn dispatch(
        &self,
        endpoint: &str,
        batch: &[TimeSeries],
        debug: bool,
    ) -> Result<(), DispatchError>;
}

/// Sends batches as snappy-compressed protobuf `WriteRequest`s over HTTP.
pub struct RemoteWriteDispatcher {
    client: reqwest::Client,
}

impl RemoteWriteDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("snappy"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-protobuf"),
        );
        headers.insert(
            REMOTE_WRITE_VERSION_HEADER,
            HeaderValue::from_static(REMOTE_WRITE_VERSION),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(RemoteWriteDispatcher { client })
    }
}

#[async_trait]
impl Dispatcher for RemoteWriteDispatcher {
    async fn dispatch(
        &self,
        endpoint: &str,
        batch: &[TimeSeries],
        debug: bool,
    ) -> Result<(), DispatchError> {
        let body = compress_write_request(batch)?;
        let time = Instant::now();
        let response = self.client.post(endpoint).body(body).send().await?;
        let elapsed = time.elapsed();

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() != 200 && status.as_u16() != 204 {
            return Err(DispatchError::Status { status, body });
        }

        debug!(
            "Sent {} series to {endpoint} in {} ms",
            batch.len(),
            elapsed.as_millis()
        );
        if debug {
            debug!("Response from {endpoint}: {status} {body}");
        }
        Ok(())
    }
}
