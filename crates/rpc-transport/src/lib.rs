//! RPC Transport Layer
//!
//! Line-framed TCP transport hosting the dispatch core. The transport
//! handles:
//! - Listener set-up per worker (optionally with SO_REUSEPORT)
//! - Connection lifecycle (connect gate, message, close)
//! - Text framing: one JSON document per `\n`-terminated line
//!
//! The transport is decoupled from dispatch logic via the
//! `ConnectionHandler` trait.

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::{
    ConnectDecision, ConnectionHandler, TransportConfig, TransportError, TransportServer,
};
