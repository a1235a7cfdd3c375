//! Upstream peers and datacenter-based selection
//!
//! Peers are written as URIs:
//! - `direct://host[:port]` connects to a datacenter with no secret
//! - `proxy://host[:port]/<hex secret>` chains through another obfuscated proxy
//!
//! The port defaults to 443.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{ProxyError, Result};

/// Port used when a peer URI has none
pub const DEFAULT_PEER_PORT: u16 = 443;

/// One configured upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    host: String,
    port: u16,
    secret: Option<Bytes>,
}

impl PeerRecord {
    pub fn new(host: impl Into<String>, port: u16, secret: Option<Bytes>) -> Self {
        Self {
            host: host.into(),
            port,
            secret,
        }
    }

    /// Parse a `direct://` or `proxy://` URI
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::Config(format!("peer {}: {}", uri, reason));

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        let (host, port) = split_host_port(authority).map_err(|e| invalid(e))?;

        let secret = match scheme {
            "direct" => {
                if !path.is_empty() {
                    return Err(invalid("direct peers cannot have a secret"));
                }
                None
            }
            "proxy" => {
                let hex_secret = path.strip_prefix('/').unwrap_or(path);
                if hex_secret.is_empty() {
                    return Err(invalid("proxy peers must have a secret"));
                }
                let secret = hex::decode(hex_secret)
                    .map_err(|e| invalid(&format!("invalid secret: {}", e)))?;
                Some(Bytes::from(secret))
            }
            _ => return Err(invalid("unknown peer protocol")),
        };

        Ok(Self::new(host, port, secret))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Secret mixed into the client-role handshake toward this peer
    pub fn secret(&self) -> Option<&Bytes> {
        self.secret.as_ref()
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerRecord {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secret {
            Some(secret) => write!(f, "proxy {}, secret {}", self.address(), hex::encode(secret)),
            None => write!(f, "direct {}", self.address()),
        }
    }
}

fn split_host_port(authority: &str) -> std::result::Result<(String, u16), &'static str> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or("unterminated IPv6 literal")?;
        match after {
            "" => (host, None),
            _ => (
                host,
                Some(after.strip_prefix(':').ok_or("unexpected text after IPv6 literal")?),
            ),
        }
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err("missing host");
    }

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| "invalid port")?,
        None => DEFAULT_PEER_PORT,
    };

    Ok((host.to_string(), port))
}

/// Maps a requested datacenter number onto the configured peer list
#[derive(Debug, Clone)]
pub struct PeerSelector {
    peers: Arc<[PeerRecord]>,
}

impl PeerSelector {
    /// Fails on an empty list
    pub fn new(peers: Vec<PeerRecord>) -> Result<Self> {
        if peers.is_empty() {
            return Err(ProxyError::Config("at least one peer is required".into()));
        }
        Ok(Self {
            peers: peers.into(),
        })
    }

    /// Index chosen for `dc`; the sign of the number is ignored
    pub fn index_for(&self, dc: i16) -> usize {
        dc.unsigned_abs() as usize % self.peers.len()
    }

    pub fn select(&self, dc: i16) -> &PeerRecord {
        &self.peers[self.index_for(dc)]
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
