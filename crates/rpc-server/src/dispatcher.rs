//! Dispatcher: turns framed payloads into handler calls.
//!
//! Per message:
//!   1. parse the payload into a request object (404 otherwise)
//!   2. resolve the controller method (404 class/method not found)
//!   3. verify the signature unless the peer is sign-exempt (401)
//!   4. materialise the controller instance (cached per worker)
//!   5. register the configured middleware (once per identity)
//!   6. run the middleware chain around the handler call
//!   7. write the access log entry and serialize the response
//!
//! Failures in 1-5 answer directly without entering the chain. Handler
//! errors are converted inside the terminal step, so middleware always sees
//! a normal response. Anything escaping the chain is answered with 501.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use rpc_protocol::{
    ConnectionContext, ErrorDetail, IpPolicy, RequestContext, RequestEnvelope, ResponseEnvelope,
    RpcError,
};
use rpc_transport::{ConnectDecision, ConnectionHandler};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::access_log::{AccessEntry, AccessLog, LogLevel, TracingAccessLog};
use crate::auth::Authenticator;
use crate::middleware::{MiddlewareCatalog, MiddlewareChain, MiddlewareError};
use crate::registry::{
    Controller, ControllerTable, HandlerError, HandlerRef, HandlerRegistry, panic_message,
};

/// Message sent instead of the debug detail when `debug` is off.
pub const REDACTED_MESSAGE: &str = "Server internal error";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown middleware '{0}'")]
    UnknownMiddleware(String),
}

/// Start-up configuration shared by every worker's dispatcher.
#[derive(Clone)]
pub struct DispatcherConfig {
    pub policy: Arc<IpPolicy>,
    pub controllers: Arc<ControllerTable>,
    pub catalog: Arc<MiddlewareCatalog>,
    /// Middleware identities, outermost first.
    pub middleware: Vec<String>,
    pub access_log: Arc<dyn AccessLog>,
    /// Send 500/501 debug detail to clients.
    pub debug: bool,
}

impl DispatcherConfig {
    pub fn new(policy: IpPolicy, controllers: ControllerTable) -> Self {
        Self {
            policy: Arc::new(policy),
            controllers: Arc::new(controllers),
            catalog: Arc::new(MiddlewareCatalog::with_builtins()),
            middleware: Vec::new(),
            access_log: Arc::new(TracingAccessLog),
            debug: true,
        }
    }

    /// Fail fast on middleware identities the catalog cannot build.
    pub fn validate(&self) -> Result<(), DispatchError> {
        match self.middleware.iter().find(|id| !self.catalog.contains(id)) {
            Some(id) => Err(DispatchError::UnknownMiddleware(id.clone())),
            None => Ok(()),
        }
    }
}

/// Outcome of one message before it is logged.
struct Processed {
    request: Value,
    response: ResponseEnvelope,
    level: LogLevel,
}

impl Processed {
    fn info(request: Value, response: ResponseEnvelope) -> Self {
        Self {
            request,
            response,
            level: LogLevel::Info,
        }
    }

    fn error(request: Value, response: ResponseEnvelope) -> Self {
        Self {
            request,
            response,
            level: LogLevel::Error,
        }
    }
}

/// One worker's dispatcher. Owns the worker's controller instance cache and
/// middleware registration set.
pub struct Dispatcher {
    authenticator: Authenticator,
    registry: HandlerRegistry,
    chain: MiddlewareChain,
    catalog: Arc<MiddlewareCatalog>,
    middleware: Vec<String>,
    access_log: Arc<dyn AccessLog>,
    debug: bool,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            authenticator: Authenticator::new(config.policy),
            registry: HandlerRegistry::new(config.controllers),
            chain: MiddlewareChain::new(),
            catalog: config.catalog,
            middleware: config.middleware,
            access_log: config.access_log,
            debug: config.debug,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    /// Handle one payload end to end and return the response envelope.
    pub fn dispatch(&self, connection: &ConnectionContext, payload: &str) -> ResponseEnvelope {
        let started = Instant::now();
        let processed = self.process(connection, payload);
        self.finish(connection, started, processed)
    }

    /// Like [`dispatch`](Self::dispatch) for a payload straight off the
    /// socket. Bytes that are not UTF-8 are a malformed request.
    pub fn dispatch_bytes(&self, connection: &ConnectionContext, payload: &[u8]) -> ResponseEnvelope {
        match std::str::from_utf8(payload) {
            Ok(text) => self.dispatch(connection, text),
            Err(_) => {
                let started = Instant::now();
                let raw = Value::String(String::from_utf8_lossy(payload).into_owned());
                let processed = Processed::info(raw, RpcError::parameter_exception().into_response());
                self.finish(connection, started, processed)
            }
        }
    }

    /// Write the access entry and apply redaction.
    fn finish(
        &self,
        connection: &ConnectionContext,
        started: Instant,
        processed: Processed,
    ) -> ResponseEnvelope {
        let entry = AccessEntry {
            connection,
            level: processed.level,
            elapsed: started.elapsed(),
            request: &processed.request,
            response: &processed.response,
        };
        if let Err(e) = self.access_log.record(&entry) {
            warn!("Access log write failed for {}: {e}", connection.peer());
            return RpcError::logging_failure(e.to_string()).into_response();
        }

        let mut response = processed.response;
        if !self.debug && processed.level == LogLevel::Error {
            response.msg = Value::String(REDACTED_MESSAGE.to_string());
        }
        response
    }

    fn process(&self, connection: &ConnectionContext, payload: &str) -> Processed {
        let (envelope, raw) = match RequestEnvelope::parse(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Processed::info(Value::String(payload.to_string()), err.into_response());
            }
        };

        let handler = match self.authorize(connection, &envelope) {
            Ok(handler) => handler,
            Err(err) => return Processed::info(raw, err.into_response()),
        };

        let instance = match self.registry.instance_of(&handler) {
            Ok(instance) => instance,
            Err(err) => {
                if err.is_unexpected() {
                    error!("Failed to construct {}: {err}", handler.key().class_key());
                    return Processed::error(raw, err.into_response());
                }
                return Processed::info(raw, err.into_response());
            }
        };

        if let Err(err) = self.register_middleware() {
            error!("Middleware registration failed: {err}");
            return Processed::error(raw, RpcError::infrastructure(err.detail).into_response());
        }

        let request = RequestContext {
            connection: connection.clone(),
            app_dir: self.registry.app_dir().to_string(),
            routing_key: handler.key().to_string(),
            envelope,
            raw,
        };

        let unexpected = Cell::new(false);
        let terminal = |request: &RequestContext| {
            match invoke_guarded(instance.as_ref(), &handler, request) {
                Ok(response) => response,
                Err(err) => {
                    if err.is_unexpected() {
                        unexpected.set(true);
                        error!("Handler {} failed: {err}", handler.key());
                    }
                    err.into_response()
                }
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.chain.handle(&request, &terminal)));
        match outcome {
            Ok(Ok(response)) if unexpected.get() => Processed::error(request.raw, response),
            Ok(Ok(response)) => Processed::info(request.raw, response),
            Ok(Err(err)) => {
                error!("Middleware chain failed for {}: {err}", request.routing_key);
                Processed::error(request.raw, RpcError::infrastructure(err.detail).into_response())
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!("Middleware chain panicked for {}: {message}", request.routing_key);
                let detail = ErrorDetail::at(message, request.routing_key.clone(), 0);
                Processed::error(request.raw, RpcError::infrastructure(detail).into_response())
            }
        }
    }

    /// Route first, then check the signature: unknown routes answer 404
    /// even when unsigned.
    fn authorize(
        &self,
        connection: &ConnectionContext,
        envelope: &RequestEnvelope,
    ) -> Result<HandlerRef, RpcError> {
        let handler = self.registry.resolve(envelope)?;
        self.authenticator.verify(connection, envelope)?;
        Ok(handler)
    }

    fn register_middleware(&self) -> Result<(), MiddlewareError> {
        for id in &self.middleware {
            let factory = self
                .catalog
                .factory(id)
                .ok_or_else(|| MiddlewareError::new(format!("unknown middleware '{id}'")))?;
            self.chain.register(id, || {
                panic::catch_unwind(AssertUnwindSafe(|| factory())).unwrap_or_else(|panic| {
                    Err(MiddlewareError::from_detail(ErrorDetail::at(
                        panic_message(&*panic),
                        format!("middleware '{id}'"),
                        0,
                    )))
                })
            })?;
        }
        Ok(())
    }
}

/// Inner boundary: a panicking handler becomes an unexpected error.
fn invoke_guarded(
    instance: &dyn Controller,
    handler: &HandlerRef,
    request: &RequestContext,
) -> Result<ResponseEnvelope, HandlerError> {
    let method = handler.key().method();
    let args = request.envelope.args();
    match panic::catch_unwind(AssertUnwindSafe(|| instance.invoke(method, args))) {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Unexpected(ErrorDetail::at(
            panic_message(&*panic),
            handler.key().to_string(),
            0,
        ))),
    }
}

impl ConnectionHandler for Dispatcher {
    fn on_connect(&self, connection: &ConnectionContext) -> ConnectDecision {
        match self.authenticator.gate(connection) {
            Ok(()) => {
                debug!("Client connected: {} ({})", connection.peer(), connection.id);
                ConnectDecision::Accept
            }
            Err(err) => {
                warn!("Connection rejected: {} not in allow-list", connection.peer());
                ConnectDecision::Reject(err.into_response().to_json())
            }
        }
    }

    fn on_message(&self, connection: &ConnectionContext, payload: &[u8]) -> String {
        self.dispatch_bytes(connection, payload).to_json()
    }

    fn on_close(&self, connection: &ConnectionContext) {
        debug!("Client disconnected: {} ({})", connection.peer(), connection.id);
    }
}
