//! Encoding and decoding of the proxy configuration string.
//!
//! The proxy container's last argument is a comma-separated list of
//! `{protocol}:{port}=>amqp:{queue}` items; the empty string denotes "no
//! ports". The Deployment carrying this string is the durable record of the
//! engine's state, so both directions must be lossless. Queue names may
//! legally contain `-` and mixed case, so the decoder must never split the
//! queue itself; it is everything after the first `=>amqp:` of an item.

use crate::{PortCache, Protocol, PublicPort};
use std::collections::HashSet;
use thiserror::Error;

const QUEUE_DELIMITER: &str = "=>amqp:";

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported protocol in config item: {0}")]
    UnsupportedProtocol(String),
    #[error("missing port in config item: {0}")]
    MissingPort(String),
    #[error("invalid port in config item: {0}")]
    InvalidPort(String),
    #[error("missing queue in config item: {0}")]
    MissingQueue(String),
}

/// Renders a cache snapshot as the proxy's configuration string.
///
/// Items are ordered by ascending port so that the output is deterministic.
/// Queue names that collide after lowercasing are flagged here because they
/// will collide again as Service port names.
pub fn encode(cache: &PortCache) -> String {
    let mut entries: Vec<&PublicPort> = cache.iter().collect();
    entries.sort_by_key(|pp| pp.port);

    let mut lowered = HashSet::new();
    for pp in &entries {
        if !lowered.insert(pp.queue.to_lowercase()) {
            tracing::warn!(
                port = %pp.port,
                queue = %pp.queue,
                "Queue name collides with another queue after lowercasing",
            );
        }
    }

    entries
        .into_iter()
        .map(encode_port)
        .collect::<Vec<_>>()
        .join(",")
}

fn encode_port(pp: &PublicPort) -> String {
    format!("{}:{}{}{}", pp.protocol, pp.port, QUEUE_DELIMITER, pp.queue)
}

/// Parses a configuration string back into its public ports.
pub fn decode(config: &str) -> Result<Vec<PublicPort>, DecodeError> {
    if config.is_empty() {
        return Ok(Vec::new());
    }
    config.split(',').map(decode_item).collect()
}

fn decode_item(item: &str) -> Result<PublicPort, DecodeError> {
    let (prefix, rest) = item
        .split_once(':')
        .ok_or_else(|| DecodeError::UnsupportedProtocol(item.to_string()))?;
    let protocol = match prefix {
        "http" => Protocol::Http,
        "http2" => Protocol::Http2,
        "tcp" => Protocol::Tcp,
        _ => return Err(DecodeError::UnsupportedProtocol(item.to_string())),
    };

    let (port, queue) = match rest.split_once(QUEUE_DELIMITER) {
        Some((port, queue)) => (port, queue),
        // The port is still delimited by `=>` when the queue marker itself
        // is mangled; distinguish a bad suffix from a missing port.
        None if rest.contains("=>") => {
            return Err(DecodeError::MissingQueue(item.to_string()))
        }
        None => return Err(DecodeError::MissingPort(item.to_string())),
    };
    if port.is_empty() {
        return Err(DecodeError::MissingPort(item.to_string()));
    }
    let port = port
        .parse()
        .map_err(|_| DecodeError::InvalidPort(item.to_string()))?;
    if queue.is_empty() {
        return Err(DecodeError::MissingQueue(item.to_string()));
    }

    Ok(PublicPort {
        port,
        protocol,
        queue: queue.to_string(),
    })
}
