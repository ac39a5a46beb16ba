//! Request and response envelopes as they appear on the wire.
//!
//! Request:  `{"app": "..", "class": "..", "method": "..", "sign": "..", "args": {..}}`
//! Response: `{"code": <int>, "msg": <string | object>}`

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::RpcError;

/// Named arguments passed to a handler method.
pub type Args = Map<String, Value>;

/// Code used by handlers for a plain successful answer.
pub const CODE_OK: i64 = 200;

/// One inbound request, parsed fresh from every message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(
        default,
        deserialize_with = "scalar_as_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub app: Option<String>,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub method: String,
    /// Kept as sent; anything but the expected string fails verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Args>,
}

impl RequestEnvelope {
    /// Parse a raw payload.
    ///
    /// Returns the typed envelope together with the raw JSON object, which
    /// is what middleware and the access log get to see. Anything that is
    /// not a JSON object with the expected field types is a
    /// "parameter exception".
    pub fn parse(payload: &str) -> Result<(Self, Value), RpcError> {
        let raw: Value =
            serde_json::from_str(payload).map_err(|_| RpcError::parameter_exception())?;
        if !raw.is_object() {
            return Err(RpcError::parameter_exception());
        }
        let envelope =
            Self::deserialize(&raw).map_err(|_| RpcError::parameter_exception())?;
        Ok((envelope, raw))
    }

    /// The signature, if one was sent as a string.
    pub fn sign(&self) -> Option<&str> {
        self.sign.as_ref().and_then(Value::as_str)
    }

    /// Handler arguments, empty when absent.
    pub fn args(&self) -> Args {
        self.args.clone().unwrap_or_default()
    }
}

/// `app` is a path segment, so numbers and booleans count as their text.
fn scalar_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.to_string())),
        Some(_) => Err(serde::de::Error::custom("app must be a scalar")),
    }
}

/// One outbound response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub code: i64,
    pub msg: Value,
}

impl ResponseEnvelope {
    pub fn new(code: i64, msg: impl Into<Value>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn ok(msg: impl Into<Value>) -> Self {
        Self::new(CODE_OK, msg)
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            // Only reachable with non-string map keys, which Value cannot hold
            Err(e) => format!(r#"{{"code":501,"msg":{:?}}}"#, e.to_string()),
        }
    }
}
