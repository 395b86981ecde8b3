// src/main.rs

//! The main entry point for the elinproxy server application.

use anyhow::Result;
use elinproxy::config::Config;
use elinproxy::rules::Rules;
use elinproxy::server;
use std::env;
use std::path::Path;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("elinproxy version {VERSION}");
        return Ok(());
    }

    let flag = |name: &str| {
        args.iter()
            .position(|arg| arg == name)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    };

    let server_conf_file = flag("--server").unwrap_or("server.conf");
    let cache_conf_file = flag("--cache").unwrap_or("cache.conf");

    // Load the configuration before anything else; the proxy must not open
    // listeners with a half-understood config.
    let mut config = match Config::from_file(Path::new(server_conf_file)) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load configuration from \"{server_conf_file}\": {err}");
            std::process::exit(1);
        }
    };

    let rules = match Rules::from_file(Path::new(cache_conf_file)) {
        Ok(rules) => rules,
        Err(err) => {
            eprintln!("Failed to load cache rules from \"{cache_conf_file}\": {err}");
            std::process::exit(1);
        }
    };

    if let Some(port) = flag("--metrics-port") {
        match port.parse() {
            Ok(port) => config.metrics_port = port,
            Err(_) => {
                eprintln!("Invalid metrics port: {port}");
                std::process::exit(1);
            }
        }
    }

    // Setup logging with compact format and ANSI colors.
    let default_level = if config.debug { "debug" } else { "info" };
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    tracing::info!("elinproxy version {VERSION}");

    let reload = server::ReloadPaths {
        server: Path::new(server_conf_file).to_path_buf(),
        cache: Path::new(cache_conf_file).to_path_buf(),
    };
    if let Err(err) = server::run(config, rules, Some(reload)).await {
        error!("Server runtime error: {}", err);
        return Err(err);
    }

    Ok(())
}
