#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
mod ports;

pub use self::cache::PortCache;
pub use self::ports::{PortHasher, PortMap};

use std::num::NonZeroU16;

/// Application protocol of a public port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Http2,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Http2 => "http2",
            Self::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported protocol: {0}")]
pub struct UnsupportedProtocol(String);

impl std::str::FromStr for Protocol {
    type Err = UnsupportedProtocol;

    /// Parses case-insensitively; the Controller capitalises freely.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("http") {
            Ok(Self::Http)
        } else if s.eq_ignore_ascii_case("http2") {
            Ok(Self::Http2)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else {
            Err(UnsupportedProtocol(s.to_string()))
        }
    }
}

impl serde::Serialize for Protocol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Protocol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize<'de>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A `(port, protocol, queue)` triple advertised by the Controller.
///
/// The queue is an opaque AMQP routing identifier; it is compared verbatim,
/// though it is lowercased where it projects into a Service port name.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct PublicPort {
    pub port: NonZeroU16,
    pub protocol: Protocol,
    pub queue: String,
}
