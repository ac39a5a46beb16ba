//! Controllers shipped with the server binary.

use rpc_protocol::{Args, ResponseEnvelope};
use rpc_server::{Controller, ControllerTable, HandlerError, HandlerResult};
use serde_json::{Value, json};

/// Liveness checks: `{"class": "health", "method": "ping" | "echo"}`.
pub struct HealthController {
    started_at: chrono::DateTime<chrono::Local>,
}

impl Controller for HealthController {
    fn construct() -> Result<Self, HandlerError> {
        Ok(Self {
            started_at: chrono::Local::now(),
        })
    }

    fn methods() -> &'static [&'static str] {
        &["ping", "echo"]
    }

    fn invoke(&self, method: &str, args: Args) -> HandlerResult {
        match method {
            "ping" => Ok(ResponseEnvelope::ok(json!({
                "pong": true,
                "time": chrono::Local::now().to_rfc3339(),
                "up_since": self.started_at.to_rfc3339(),
            }))),
            "echo" => Ok(ResponseEnvelope::ok(Value::Object(args))),
            other => Err(HandlerError::business(404, format!("method not found: {other}"))),
        }
    }
}

pub fn register(table: &mut ControllerTable) {
    table.register::<HealthController>(None, "health");
}
