//! Connection and request context threaded through dispatch.
//!
//! A [`ConnectionContext`] is created by the transport when a peer connects
//! and stays fixed until it disconnects. Every message on that connection is
//! wrapped into a [`RequestContext`] before it enters the middleware chain.

use std::net::SocketAddr;

use serde_json::Value;

use crate::envelope::RequestEnvelope;

/// Per-connection metadata, immutable for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Unique identifier for the connection (log correlation only).
    pub id: String,
    pub remote_ip: String,
    pub remote_port: u16,
}

impl ConnectionContext {
    pub fn new(id: impl Into<String>, remote_ip: impl Into<String>, remote_port: u16) -> Self {
        Self {
            id: id.into(),
            remote_ip: remote_ip.into(),
            remote_port,
        }
    }

    /// Build from a peer address. IPv4-mapped IPv6 addresses are reported
    /// in their IPv4 form so allow-lists can stay IPv4.
    pub fn from_peer(id: impl Into<String>, peer: SocketAddr) -> Self {
        Self::new(id, peer.ip().to_canonical().to_string(), peer.port())
    }

    /// `ip:port`, as it appears in log lines.
    pub fn peer(&self) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port)
    }
}

/// Everything a middleware can see about the request it wraps.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub connection: ConnectionContext,
    /// Application root the routing key was built from.
    pub app_dir: String,
    /// Fully resolved routing key, `app_dir/app/controller/ClassController#method`.
    pub routing_key: String,
    pub envelope: RequestEnvelope,
    /// The request object exactly as received.
    pub raw: Value,
}
