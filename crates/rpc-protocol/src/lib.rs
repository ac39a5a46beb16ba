//! Text RPC protocol types.
//!
//! Line-framed JSON requests addressed by `app`/`class`/`method`, answered
//! with a `{code, msg}` envelope. This crate is the single source of truth
//! for envelopes, response codes, and the contexts passed through dispatch.

pub mod auth;
pub mod context;
pub mod envelope;
pub mod error;

pub use auth::IpPolicy;
pub use context::{ConnectionContext, RequestContext};
pub use envelope::{Args, CODE_OK, RequestEnvelope, ResponseEnvelope};
pub use error::{ErrorDetail, RpcError, RpcErrorCode};
