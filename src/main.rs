//! thb-rpc: line-framed JSON RPC server
//!
//! Accepts persistent TCP connections from allow-listed peers, routes each
//! newline-terminated request to a controller method, and answers with one
//! `{"code", "msg"}` line per request.
//!
//! Usage:
//!   thb-rpc                                  # Defaults: 0.0.0.0:8888, 8 workers
//!   thb-rpc --config rpc.toml                # Load settings from TOML
//!   thb-rpc --config rpc.toml --port 9000    # CLI flags override the file
//!   thb-rpc --verbose --log-file rpc.log     # Debug logging to a file

mod config;
mod controllers;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rpc_server::{
    AccessLog, AccessLogSet, ControllerTable, Dispatcher, DispatcherConfig, JsonLinesAccessLog,
    MiddlewareCatalog, TracingAccessLog,
};
use rpc_transport::TransportServer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "thb-rpc", about = "thb-rpc: line-framed JSON RPC server")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    listen: Option<String>,

    /// Port to listen on (0 for OS-assigned)
    #[arg(long)]
    port: Option<u16>,

    /// Number of workers
    #[arg(long)]
    count: Option<usize>,

    /// Share one listener between workers instead of SO_REUSEPORT
    #[arg(long)]
    no_reuse_port: bool,

    /// Application root used in routing keys
    #[arg(long)]
    app_dir: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(ref listen) = self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(count) = self.count {
            config.server.count = count;
        }
        if self.no_reuse_port {
            config.server.reuse_port = false;
        }
        if let Some(ref app_dir) = self.app_dir {
            config.rpc.app_dir = app_dir.clone();
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<(), std::io::Error> {
    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if let Some(ref log_path) = cli.log_file {
        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn build_access_log(config: &ServerConfig) -> Result<Arc<dyn AccessLog>, rpc_server::AccessLogError> {
    match config.rpc.access_log {
        Some(ref path) => {
            let file = JsonLinesAccessLog::open(path)?;
            info!("Access log: {}", file.path().display());
            Ok(Arc::new(AccessLogSet::new().with(TracingAccessLog).with(file)))
        }
        None => Ok(Arc::new(TracingAccessLog)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("Failed to open log file: {e}");
        std::process::exit(1);
    }

    let mut config = match cli.config {
        Some(ref path) => match ServerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };
    cli.apply(&mut config);

    if config.policy.allowed_ips.is_empty() {
        warn!("policy.allowed_ips is empty: every connection will be rejected");
    }

    let access_log = match build_access_log(&config) {
        Ok(log) => log,
        Err(e) => {
            error!("Failed to open access log: {e}");
            std::process::exit(1);
        }
    };

    let mut controllers = ControllerTable::new(config.rpc.app_dir.clone());
    controllers::register(&mut controllers);

    let dispatch_config = DispatcherConfig {
        policy: Arc::new(config.policy.clone()),
        controllers: Arc::new(controllers),
        catalog: Arc::new(MiddlewareCatalog::with_builtins()),
        middleware: config.rpc.middleware.clone(),
        access_log,
        debug: config.rpc.debug,
    };
    if let Err(e) = dispatch_config.validate() {
        error!("Invalid rpc.middleware: {e}");
        std::process::exit(1);
    }

    println!();
    println!("  thb-rpc server");
    println!();
    println!("  Binding:    {}:{}", config.server.listen, config.server.port);
    println!("  Workers:    {} (reuse_port={})", config.server.count, config.server.reuse_port);
    println!("  App dir:    {}", config.rpc.app_dir);
    println!("  Middleware: {:?}", config.rpc.middleware);
    println!("  Allowed:    {} peer(s)", config.policy.allowed_ips.len());
    println!();

    let mut transport = match TransportServer::start(config.transport(), |_| {
        Dispatcher::new(dispatch_config.clone())
    })
    .await
    {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to start transport: {e}");
            std::process::exit(1);
        }
    };

    println!("  Server running on tcp://{}:{}", config.server.listen, transport.port());
    println!("  Press Ctrl+C to stop.");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {e}");
    }

    println!();
    println!("  Shutting down...");
    transport.stop().await;
    println!("  Server stopped.");
}
