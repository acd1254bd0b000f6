// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the fallible boundaries of the proxy.

use reqwest::StatusCode;

/// Failure to turn an inbound request body into a `WriteRequest`.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Error decompressing data: {0}")]
    Snappy(#[from] snap::Error),
    #[error("Error unmarshalling the WriteRequest: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Failure to deliver one batch downstream. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Could not compress the WriteRequest: {0}")]
    Encode(#[from] snap::Error),
    #[error("Could not send HTTP request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Received unexpected response code {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// The work queue no longer has any consumer.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("work queue is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}
