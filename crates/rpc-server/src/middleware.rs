//! Middleware chain wrapped around handler invocation.
//!
//! Middleware run in registration order on the way in and in reverse on
//! the way out: with `[A, B]` registered and terminal handler `H`, the call
//! graph is `A -> B -> H -> B -> A`. Each middleware gets the request and a
//! [`Next`] continuation; it may call it, skip it and answer on its own, or
//! rewrite what comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rpc_protocol::{ErrorDetail, RequestContext, ResponseEnvelope};
use tracing::{debug, warn};

pub type MiddlewareResult = Result<ResponseEnvelope, MiddlewareError>;

/// Failure raised inside the chain. Answered with code 501.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", .detail.message)]
pub struct MiddlewareError {
    pub detail: ErrorDetail,
}

impl MiddlewareError {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            detail: ErrorDetail::here(message),
        }
    }

    pub fn from_detail(detail: ErrorDetail) -> Self {
        Self { detail }
    }
}

/// Trait for request middleware.
pub trait Middleware: Send + Sync {
    /// Process a request. Call `next.run(request)` to continue down the chain.
    fn process(&self, request: &RequestContext, next: Next<'_>) -> MiddlewareResult;

    /// Middleware name for debugging.
    fn name(&self) -> &str;
}

/// Terminal step of the chain: the handler call. It never fails; handler
/// errors are already converted to envelopes.
pub type Terminal<'a> = &'a dyn Fn(&RequestContext) -> ResponseEnvelope;

/// Continuation handed to a middleware: the rest of the chain plus the terminal.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    terminal: Terminal<'a>,
}

impl<'a> Next<'a> {
    pub fn run(self, request: &RequestContext) -> MiddlewareResult {
        match self.remaining.split_first() {
            Some((middleware, rest)) => middleware.process(
                request,
                Next {
                    remaining: rest,
                    terminal: self.terminal,
                },
            ),
            None => Ok((self.terminal)(request)),
        }
    }
}

/// Ordered, identity-deduplicated set of middleware.
///
/// Registration may be requested on every message; an identity that is
/// already present is ignored without constructing anything, so the chain
/// never grows past one entry per identity.
pub struct MiddlewareChain {
    entries: RwLock<Vec<(String, Arc<dyn Middleware>)>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Append the middleware built by `make` under `id`, unless `id` is
    /// already registered. Returns whether it was appended.
    pub fn register<F>(&self, id: &str, make: F) -> Result<bool, MiddlewareError>
    where
        F: FnOnce() -> Result<Arc<dyn Middleware>, MiddlewareError>,
    {
        if self.contains(id) {
            return Ok(false);
        }
        let mut entries = self.entries.write();
        // Re-check under the write lock
        if entries.iter().any(|(existing, _)| existing == id) {
            return Ok(false);
        }
        let middleware = make()?;
        debug!("Registered middleware {id} ({})", middleware.name());
        entries.push((id.to_string(), middleware));
        Ok(true)
    }

    /// Append an already-built middleware, identified by its type.
    pub fn register_instance<M: Middleware + 'static>(&self, middleware: M) -> bool {
        let id = std::any::type_name::<M>();
        // The closure cannot fail
        self.register(id, move || Ok(Arc::new(middleware) as Arc<dyn Middleware>))
            .unwrap_or(false)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().iter().any(|(existing, _)| existing == id)
    }

    /// Run the chain around `terminal`.
    pub fn handle(&self, request: &RequestContext, terminal: Terminal<'_>) -> MiddlewareResult {
        // Snapshot so no lock is held while handlers run
        let snapshot: Vec<Arc<dyn Middleware>> =
            self.entries.read().iter().map(|(_, m)| m.clone()).collect();
        Next {
            remaining: &snapshot,
            terminal,
        }
        .run(request)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog of configurable middleware
// ─────────────────────────────────────────────────────────────────────────────

pub type MiddlewareFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Middleware>, MiddlewareError> + Send + Sync>;

/// Maps the middleware identities used in configuration to constructors.
#[derive(Clone, Default)]
pub struct MiddlewareCatalog {
    factories: HashMap<String, MiddlewareFactory>,
}

impl MiddlewareCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the middleware shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.add(SlowRequestLog::ID, || {
            Ok(Arc::new(SlowRequestLog::default()) as Arc<dyn Middleware>)
        });
        catalog
    }

    pub fn add<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn Middleware>, MiddlewareError> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn factory(&self, id: &str) -> Option<&MiddlewareFactory> {
        self.factories.get(id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in middleware
// ─────────────────────────────────────────────────────────────────────────────

/// Warns about requests that take longer than a threshold. Passes the
/// response through untouched.
pub struct SlowRequestLog {
    threshold: Duration,
}

impl SlowRequestLog {
    pub const ID: &'static str = "slow_request";

    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

impl Default for SlowRequestLog {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Middleware for SlowRequestLog {
    fn process(&self, request: &RequestContext, next: Next<'_>) -> MiddlewareResult {
        let started = Instant::now();
        let response = next.run(request)?;
        let elapsed = started.elapsed();
        if elapsed >= self.threshold {
            warn!(
                peer = %request.connection.peer(),
                route = %request.routing_key,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow rpc request"
            );
        }
        Ok(response)
    }

    fn name(&self) -> &str {
        Self::ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rpc_protocol::{ConnectionContext, RequestEnvelope};
    use serde_json::{Value, json};

    fn request() -> RequestContext {
        RequestContext {
            connection: ConnectionContext::new("c", "127.0.0.1", 1),
            app_dir: "rpc".into(),
            routing_key: "rpc/default/controller/UserController#get".into(),
            envelope: RequestEnvelope::default(),
            raw: Value::Null,
        }
    }

    /// Records entry and exit into a shared trace.
    struct Tracer {
        label: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Tracer {
        fn process(&self, request: &RequestContext, next: Next<'_>) -> MiddlewareResult {
            self.trace.lock().push(format!("{}:before", self.label));
            let response = next.run(request)?;
            self.trace.lock().push(format!("{}:after", self.label));
            Ok(response)
        }

        fn name(&self) -> &str {
            self.label
        }
    }

    struct ShortCircuit;

    impl Middleware for ShortCircuit {
        fn process(&self, _request: &RequestContext, _next: Next<'_>) -> MiddlewareResult {
            Ok(ResponseEnvelope::new(403, "blocked"))
        }

        fn name(&self) -> &str {
            "short_circuit"
        }
    }

    fn tracer(label: &'static str, trace: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(Tracer {
            label,
            trace: trace.clone(),
        })
    }

    #[test]
    fn empty_chain_runs_terminal() {
        let chain = MiddlewareChain::new();
        let response = chain
            .handle(&request(), &|_| ResponseEnvelope::ok("done"))
            .unwrap();
        assert_eq!(response, ResponseEnvelope::ok("done"));
    }

    #[test]
    fn first_registered_is_outermost() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.register("a", || Ok(tracer("A", &trace))).unwrap();
        chain.register("b", || Ok(tracer("B", &trace))).unwrap();

        let terminal_trace = trace.clone();
        let terminal = move |_: &RequestContext| {
            terminal_trace.lock().push("H".to_string());
            ResponseEnvelope::ok(json!("h"))
        };
        chain.handle(&request(), &terminal).unwrap();

        assert_eq!(
            *trace.lock(),
            vec!["A:before", "B:before", "H", "B:after", "A:after"]
        );
    }

    #[test]
    fn duplicate_identity_is_ignored_without_constructing() {
        let chain = MiddlewareChain::new();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut built = 0;
        for _ in 0..5 {
            chain
                .register("a", || {
                    built += 1;
                    Ok(tracer("A", &trace))
                })
                .unwrap();
        }
        assert_eq!(built, 1);
        assert_eq!(chain.ids(), vec!["a".to_string()]);
    }

    #[test]
    fn register_instance_dedupes_by_type() {
        let chain = MiddlewareChain::new();
        assert!(chain.register_instance(ShortCircuit));
        assert!(!chain.register_instance(ShortCircuit));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn middleware_can_short_circuit() {
        let chain = MiddlewareChain::new();
        chain.register_instance(ShortCircuit);
        let called = std::cell::Cell::new(false);
        let terminal = |_: &RequestContext| {
            called.set(true);
            ResponseEnvelope::ok("unreachable")
        };
        let response = chain.handle(&request(), &terminal).unwrap();
        assert_eq!(response.code, 403);
        assert!(!called.get());
    }

    #[test]
    fn failing_factory_leaves_chain_unchanged() {
        let chain = MiddlewareChain::new();
        let err = chain
            .register("broken", || Err(MiddlewareError::new("no config")))
            .unwrap_err();
        assert_eq!(err.to_string(), "no config");
        assert!(chain.is_empty());
    }

    #[test]
    fn catalog_knows_builtins() {
        let catalog = MiddlewareCatalog::with_builtins();
        assert!(catalog.contains("slow_request"));
        let middleware = (catalog.factory("slow_request").unwrap())().unwrap();
        assert_eq!(middleware.name(), "slow_request");
    }
}
