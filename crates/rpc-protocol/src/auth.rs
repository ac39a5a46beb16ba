//! IP policy configuration consumed by the authenticator.
//!
//! Two checks share this policy:
//!   1. On connect, the peer IP must be listed in `allowed_ips` or the
//!      connection is answered with code 301 and closed.
//!   2. On every message from a peer not listed in `sign_exempt_ips`, the
//!      request must carry `sign = UPPER(HEX(MD5("ip=<peer ip>&appSecret=<secret>")))`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Loaded once per worker; read-only afterwards.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct IpPolicy {
    /// Peers allowed to connect at all.
    #[serde(default)]
    pub allowed_ips: HashSet<String>,
    /// Shared secret mixed into the request signature.
    #[serde(default)]
    pub app_secret: String,
    /// Peers whose requests skip signature verification.
    #[serde(default)]
    pub sign_exempt_ips: HashSet<String>,
}

impl IpPolicy {
    pub fn allows(&self, ip: &str) -> bool {
        self.allowed_ips.contains(ip)
    }

    pub fn is_sign_exempt(&self, ip: &str) -> bool {
        self.sign_exempt_ips.contains(ip)
    }
}

impl std::fmt::Debug for IpPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpPolicy")
            .field("allowed_ips", &self.allowed_ips)
            .field("app_secret", &"<redacted>")
            .field("sign_exempt_ips", &self.sign_exempt_ips)
            .finish()
    }
}
