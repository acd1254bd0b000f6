// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus remote-write data model and codec.
//!
//! Only the fields the proxy reads are declared. Anything else a client sends (exemplars,
//! native histograms, metadata) is skipped by the decoder and not forwarded.

use crate::errors::DecodeError;
use prost::Message;

/// Label carrying the metric name of a series.
pub const METRIC_NAME_LABEL: &str = "__name__";

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl TimeSeries {
    /// Value of the `__name__` label. An empty name counts as missing.
    #[must_use]
    pub fn metric_name(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.name == METRIC_NAME_LABEL)
            .map(|label| label.value.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Labels other than `__name__`, in wire order.
    pub fn tag_labels(&self) -> impl Iterator<Item = &Label> {
        self.labels
            .iter()
            .filter(|label| label.name != METRIC_NAME_LABEL)
    }
}

/// Decompresses (snappy block format) and decodes a remote-write body.
pub fn decode_write_request(body: &[u8]) -> Result<WriteRequest, DecodeError> {
    let data = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(WriteRequest::decode(data.as_slice())?)
}

/// Size in bytes of the protobuf encoding of a `WriteRequest` holding `batch`.
#[must_use]
pub fn encoded_len(batch: &[TimeSeries]) -> usize {
    prost::encoding::message::encoded_len_repeated(1, batch)
}

/// Encodes `batch` as an uncompressed `WriteRequest` without cloning the series.
#[must_use]
pub fn encode_write_request(batch: &[TimeSeries]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(batch));
    for series in batch {
        prost::encoding::message::encode(1, series, &mut buf);
    }
    buf
}

/// Encodes `batch` and compresses it for the wire.
pub fn compress_write_request(batch: &[TimeSeries]) -> Result<Vec<u8>, snap::Error> {
    snap::raw::Encoder::new().compress_vec(&encode_write_request(batch))
}
