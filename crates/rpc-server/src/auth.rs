//! Connection gating and request signature verification.

use std::sync::Arc;

use rpc_protocol::{ConnectionContext, IpPolicy, RequestEnvelope, RpcError};

/// Signature a peer at `ip` must send: `UPPER(HEX(MD5("ip=<ip>&appSecret=<secret>")))`.
pub fn sign_for(ip: &str, app_secret: &str) -> String {
    format!("{:X}", md5::compute(format!("ip={ip}&appSecret={app_secret}")))
}

/// Applies the worker's [`IpPolicy`]. Decisions only; sending and closing
/// are the caller's job.
#[derive(Debug, Clone)]
pub struct Authenticator {
    policy: Arc<IpPolicy>,
}

impl Authenticator {
    pub fn new(policy: Arc<IpPolicy>) -> Self {
        Self { policy }
    }

    /// Connect-time allow-list check.
    pub fn gate(&self, connection: &ConnectionContext) -> Result<(), RpcError> {
        if self.policy.allows(&connection.remote_ip) {
            Ok(())
        } else {
            Err(RpcError::connection_not_permitted())
        }
    }

    pub fn is_sign_exempt(&self, connection: &ConnectionContext) -> bool {
        self.policy.is_sign_exempt(&connection.remote_ip)
    }

    /// Per-request signature check, skipped for sign-exempt peers.
    pub fn verify(
        &self,
        connection: &ConnectionContext,
        envelope: &RequestEnvelope,
    ) -> Result<(), RpcError> {
        if self.is_sign_exempt(connection) {
            return Ok(());
        }
        let expected = sign_for(&connection.remote_ip, &self.policy.app_secret);
        match envelope.sign() {
            Some(sign) if sign == expected => Ok(()),
            _ => Err(RpcError::signature_failed()),
        }
    }
}
