// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shard hashing for metric names.
//!
//! The shard id of a series is the 32-bit FNV-1a hash of its metric name. The same value picks
//! the batch the series joins and, modulo the endpoint count, the downstream endpoint it is sent
//! to, so every series of one metric lands on the same endpoint while the endpoint list is stable.

const FNV1A_32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV1A_32_PRIME: u32 = 0x0100_0193;

/// Returns the shard id for a metric name.
#[must_use]
pub fn shard_of(metric_name: &str) -> u32 {
    metric_name
        .as_bytes()
        .iter()
        .fold(FNV1A_32_OFFSET_BASIS, |hash, byte| {
            (hash ^ u32::from(*byte)).wrapping_mul(FNV1A_32_PRIME)
        })
}

/// Picks the endpoint owning `shard`. `None` only when `endpoints` is empty.
#[must_use]
pub fn select_endpoint(shard: u32, endpoints: &[String]) -> Option<&str> {
    if endpoints.is_empty() {
        return None;
    }
    let index = (shard as usize) % endpoints.len();
    endpoints.get(index).map(String::as_str)
}
