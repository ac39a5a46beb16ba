//! Server configuration, loaded once from TOML at start-up.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0"
//! port = 8888
//! count = 8
//! reuse_port = true
//!
//! [rpc]
//! app_dir = "rpc"
//! middleware = ["slow_request"]
//! debug = true
//! access_log = "runtime/logs/rpc.log"
//!
//! [policy]
//! allowed_ips = ["127.0.0.1"]
//! app_secret = "change-me"
//! sign_exempt_ips = ["127.0.0.1"]
//! ```

use std::path::{Path, PathBuf};

use rpc_protocol::IpPolicy;
use rpc_transport::TransportConfig;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ListenConfig,
    pub rpc: RpcConfig,
    pub policy: IpPolicy,
}

/// Listener settings handed to the transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub listen: String,
    pub port: u16,
    /// Worker count
    pub count: usize,
    pub reuse_port: bool,
    /// Longest accepted request line, in bytes
    pub max_package_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            listen: transport.hostname,
            port: transport.port,
            count: transport.count,
            reuse_port: transport.reuse_port,
            max_package_size: transport.max_package_size,
        }
    }
}

/// Dispatch settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Application root used as the first routing key segment
    pub app_dir: String,
    /// Middleware identities, outermost first
    pub middleware: Vec<String>,
    /// Send 500/501 debug detail to clients
    pub debug: bool,
    /// Optional JSON-lines access log file
    pub access_log: Option<PathBuf>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            app_dir: "rpc".into(),
            middleware: Vec::new(),
            debug: true,
            access_log: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            hostname: self.server.listen.clone(),
            port: self.server.port,
            count: self.server.count,
            reuse_port: self.server.reuse_port,
            max_package_size: self.server.max_package_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.server.count, 8);
        assert!(config.server.reuse_port);
        assert_eq!(config.rpc.app_dir, "rpc");
        assert!(config.rpc.debug);
        assert!(config.policy.allowed_ips.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let config = ServerConfig::from_toml(
            r#"
            [server]
            listen = "127.0.0.1"
            port = 9000
            count = 2
            reuse_port = false

            [rpc]
            app_dir = "app/rpc"
            middleware = ["slow_request"]
            debug = false
            access_log = "logs/rpc.log"

            [policy]
            allowed_ips = ["127.0.0.1", "10.0.0.2"]
            app_secret = "s3cr3t"
            sign_exempt_ips = ["127.0.0.1"]
            "#,
        )
        .unwrap();

        let transport = config.transport();
        assert_eq!(transport.hostname, "127.0.0.1");
        assert_eq!(transport.port, 9000);
        assert_eq!(transport.count, 2);
        assert!(!transport.reuse_port);
        assert_eq!(config.rpc.middleware, vec!["slow_request".to_string()]);
        assert_eq!(config.rpc.access_log, Some(PathBuf::from("logs/rpc.log")));
        assert!(config.policy.allows("10.0.0.2"));
        assert!(config.policy.is_sign_exempt("127.0.0.1"));
        assert_eq!(config.policy.app_secret, "s3cr3t");
    }

    #[test]
    fn wrong_type_is_parse_error() {
        let err = ServerConfig::from_toml("[server]\nport = \"eighty\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
