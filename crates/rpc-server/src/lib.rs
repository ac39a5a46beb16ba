//! RPC Server: the request dispatch core.
//!
//! Gates connections by IP, resolves each request to a registered
//! controller method, verifies its signature, runs it through the
//! middleware chain, and answers with a `{code, msg}` envelope. The
//! [`Dispatcher`] is the `ConnectionHandler` the transport drives; one is
//! built per worker.

pub mod access_log;
pub mod auth;
pub mod dispatcher;
pub mod middleware;
pub mod registry;

pub use access_log::{
    AccessEntry, AccessLog, AccessLogError, AccessLogSet, JsonLinesAccessLog, LogLevel,
    TracingAccessLog,
};
pub use auth::{Authenticator, sign_for};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig, REDACTED_MESSAGE};
pub use middleware::{
    Middleware, MiddlewareCatalog, MiddlewareChain, MiddlewareError, MiddlewareResult, Next,
    SlowRequestLog,
};
pub use registry::{
    Controller, ControllerTable, HandlerError, HandlerRef, HandlerRegistry, HandlerResult,
    RoutingKey,
};
