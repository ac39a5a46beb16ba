//! Controller registration and per-worker instance cache.
//!
//! Requests address a handler by `app`, `class` and `method`. Those are
//! normalised into a [`RoutingKey`]:
//!
//! ```text
//! <app_dir>/<app lowercased | "default">/controller/<Class>Controller#<method>
//! ```
//!
//! The part before `#` identifies a controller type in the
//! [`ControllerTable`]; the table also records which methods the type
//! exposes, so both "class not found" and "method not found" are decided
//! before anything is constructed.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;

use parking_lot::Mutex;
use rpc_protocol::{Args, ErrorDetail, RequestEnvelope, ResponseEnvelope, RpcError};
use tracing::{debug, warn};

/// Result returned by a controller method.
pub type HandlerResult = Result<ResponseEnvelope, HandlerError>;

/// Failure raised by a controller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Intentional user-facing error; code and message are sent as-is.
    #[error("{msg}")]
    Business { code: i64, msg: String },
    /// Anything else. Answered with code 500 and the debug detail.
    #[error("{}", .0.message)]
    Unexpected(ErrorDetail),
}

impl HandlerError {
    pub fn business(code: i64, msg: impl Into<String>) -> Self {
        Self::Business {
            code,
            msg: msg.into(),
        }
    }

    #[track_caller]
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(ErrorDetail::here(message))
    }

    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::Unexpected(_))
    }

    pub fn into_response(self) -> ResponseEnvelope {
        match self {
            Self::Business { code, msg } => RpcError::business(code, msg).into_response(),
            Self::Unexpected(detail) => RpcError::internal(detail).into_response(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        let location = Location::caller();
        Self::Unexpected(ErrorDetail::at(err.to_string(), location.file(), location.line()))
    }
}

/// Trait implemented by application controllers.
///
/// One instance per controller type is created lazily on first use and
/// reused for every later request in the same worker.
pub trait Controller: Send + Sync + 'static {
    /// Build the instance. Called at most once per worker.
    fn construct() -> Result<Self, HandlerError>
    where
        Self: Sized;

    /// Names of the methods `invoke` answers.
    fn methods() -> &'static [&'static str]
    where
        Self: Sized;

    /// Run `method` with the request's `args`.
    fn invoke(&self, method: &str, args: Args) -> HandlerResult;
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing keys
// ─────────────────────────────────────────────────────────────────────────────

/// Normalised address of one controller method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    class_key: String,
    method: String,
}

impl RoutingKey {
    pub fn new(app_dir: &str, app: Option<&str>, class: &str, method: &str) -> Self {
        Self {
            class_key: class_key(app_dir, app, class),
            method: method.to_string(),
        }
    }

    pub fn for_request(app_dir: &str, envelope: &RequestEnvelope) -> Self {
        Self::new(
            app_dir,
            envelope.app.as_deref(),
            &envelope.class,
            &envelope.method,
        )
    }

    /// Controller identity, also the instance cache key.
    pub fn class_key(&self) -> &str {
        &self.class_key
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_key, self.method)
    }
}

fn class_key(app_dir: &str, app: Option<&str>, class: &str) -> String {
    let app = match app {
        Some(app) if !app.is_empty() => app.to_lowercase(),
        _ => "default".to_string(),
    };
    format!(
        "{}/{}/controller/{}Controller",
        app_dir.trim_end_matches('/'),
        app,
        title_case(class)
    )
}

/// Upper-case the first character of every whitespace-separated word,
/// leaving the rest untouched (`userInfo` -> `UserInfo`).
fn title_case(class: &str) -> String {
    let mut out = String::with_capacity(class.len());
    let mut word_start = true;
    for ch in class.chars() {
        if word_start {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        word_start = ch.is_whitespace();
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration table
// ─────────────────────────────────────────────────────────────────────────────

type Constructor = fn() -> Result<Arc<dyn Controller>, HandlerError>;

fn construct_shared<C: Controller>() -> Result<Arc<dyn Controller>, HandlerError> {
    Ok(Arc::new(C::construct()?))
}

#[derive(Clone, Copy)]
struct ControllerEntry {
    construct: Constructor,
    methods: &'static [&'static str],
}

/// Controller types known to the server, keyed by class key.
///
/// Built once at start-up and shared read-only by every worker.
pub struct ControllerTable {
    app_dir: String,
    entries: HashMap<String, ControllerEntry>,
}

impl ControllerTable {
    pub fn new(app_dir: impl Into<String>) -> Self {
        Self {
            app_dir: app_dir.into(),
            entries: HashMap::new(),
        }
    }

    pub fn app_dir(&self) -> &str {
        &self.app_dir
    }

    /// Register controller `C` under `app` (None for the default app) and
    /// `class`. Both are normalised the same way incoming requests are.
    pub fn register<C: Controller>(&mut self, app: Option<&str>, class: &str) -> &mut Self {
        let key = class_key(&self.app_dir, app, class);
        debug!("Registering controller: {key}");
        let entry = ControllerEntry {
            construct: construct_shared::<C>,
            methods: C::methods(),
        };
        if self.entries.insert(key.clone(), entry).is_some() {
            warn!("Controller {key} registered twice; keeping the last registration");
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A resolved, known-to-exist controller method.
#[derive(Clone)]
pub struct HandlerRef {
    key: RoutingKey,
    construct: Constructor,
}

impl HandlerRef {
    pub fn key(&self) -> &RoutingKey {
        &self.key
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerRef").field(&self.key).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry with instance cache
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves requests to controllers and owns the worker's instance cache.
///
/// The cache is populated lazily, never evicted, and lives as long as the
/// registry (one per worker). Construction happens under the cache lock so
/// two requests missing the cache at once still build a single instance.
pub struct HandlerRegistry {
    table: Arc<ControllerTable>,
    instances: Mutex<HashMap<String, Arc<dyn Controller>>>,
}

impl HandlerRegistry {
    pub fn new(table: Arc<ControllerTable>) -> Self {
        Self {
            table,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn app_dir(&self) -> &str {
        self.table.app_dir()
    }

    /// Resolve a request to a controller method, or fail with 404.
    pub fn resolve(&self, envelope: &RequestEnvelope) -> Result<HandlerRef, RpcError> {
        let key = RoutingKey::for_request(self.table.app_dir(), envelope);
        let entry = self
            .table
            .entries
            .get(key.class_key())
            .ok_or_else(RpcError::class_not_found)?;
        if !entry.methods.iter().any(|m| *m == key.method()) {
            return Err(RpcError::method_not_found());
        }
        Ok(HandlerRef {
            key,
            construct: entry.construct,
        })
    }

    /// Cached instance for the handler's controller, constructing it on first use.
    pub fn instance_of(&self, handler: &HandlerRef) -> Result<Arc<dyn Controller>, HandlerError> {
        let mut instances = self.instances.lock();
        if let Some(instance) = instances.get(handler.key.class_key()) {
            return Ok(instance.clone());
        }
        let instance = match panic::catch_unwind(AssertUnwindSafe(handler.construct)) {
            Ok(built) => built?,
            Err(panic) => {
                return Err(HandlerError::Unexpected(ErrorDetail::at(
                    panic_message(&*panic),
                    handler.key.class_key(),
                    0,
                )));
            }
        };
        debug!("Constructed controller {}", handler.key.class_key());
        instances.insert(handler.key.class_key().to_string(), instance.clone());
        Ok(instance)
    }

    /// Number of controller instances built so far in this worker.
    pub fn cached_instances(&self) -> usize {
        self.instances.lock().len()
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_normalises_app_and_class() {
        let key = RoutingKey::new("rpc", Some("Shop"), "userInfo", "get");
        assert_eq!(key.class_key(), "rpc/shop/controller/UserInfoController");
        assert_eq!(key.to_string(), "rpc/shop/controller/UserInfoController#get");
    }

    #[test]
    fn routing_key_defaults_missing_app() {
        assert_eq!(
            RoutingKey::new("rpc/", None, "user", "get").class_key(),
            "rpc/default/controller/UserController"
        );
        assert_eq!(
            RoutingKey::new("rpc", Some(""), "user", "get").class_key(),
            "rpc/default/controller/UserController"
        );
    }

    #[test]
    fn title_case_touches_word_starts_only() {
        assert_eq!(title_case("user"), "User");
        assert_eq!(title_case("USER"), "USER");
        assert_eq!(title_case("order item"), "Order Item");
        assert_eq!(title_case(""), "");
    }
}
