//! mailsign - DKIM-signing SMTP submission proxy entry point

use anyhow::{anyhow, Result};
use mailsign_common::config::{Config, LoggingConfig};
use mailsign_core::{reload, ConfigHandle, KeyStore, SigningPipeline, SmtpRelay, SmtpServer};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: mailsign [OPTIONS]

Options:
  -c, --config <FILE>   Configuration file
      --check           Validate the configuration and keys, then exit
  -h, --help            Print help
  -V, --version         Print version
";

#[derive(Debug, Default)]
struct CliOptions {
    config_file: Option<PathBuf>,
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = parse_args()?;

    let config = match Config::load(opts.config_file.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_logging(&LoggingConfig::default());
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    init_logging(&config.logging);

    let key_store = Arc::new(KeyStore::new());
    let loaded = key_store.preload(&config.signing).await;

    if opts.check {
        let total = config.signing.virtual_hosts.len();
        if loaded < total {
            error!("{} of {} private keys could not be loaded", total - loaded, total);
            process::exit(1);
        }
        info!("Configuration OK");
        return Ok(());
    }

    info!("Starting mailsign...");

    let relay = Arc::new(SmtpRelay::new(&config.relay)?);
    let handle = Arc::new(ConfigHandle::with_keys(config, key_store));
    let pipeline = Arc::new(SigningPipeline::new(handle.clone()));
    let server = SmtpServer::new(handle.clone(), pipeline, relay);

    let smtp_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("SMTP server error: {}", e);
        }
    });

    let reload_handle = spawn_reload_on_hangup(handle, opts.config_file.clone());

    info!("mailsign started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    smtp_handle.abort();
    if let Some(handle) = reload_handle {
        handle.abort();
    }

    info!("mailsign shutdown complete");

    Ok(())
}

/// Reload the configuration whenever SIGHUP arrives
#[cfg(unix)]
fn spawn_reload_on_hangup(
    handle: Arc<ConfigHandle>,
    config_file: Option<PathBuf>,
) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Cannot listen for SIGHUP, reloading disabled: {}", e);
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            // Failures are logged inside; the old configuration stays active
            let _ = reload::reload(&handle, config_file.as_deref()).await;
        }
    }))
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _handle: Arc<ConfigHandle>,
    _config_file: Option<PathBuf>,
) -> Option<tokio::task::JoinHandle<()>> {
    None
}

fn parse_args() -> Result<CliOptions> {
    let mut args = env::args().skip(1);
    let mut opts = CliOptions::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{}", USAGE);
                process::exit(0);
            }
            "-V" | "--version" => {
                println!("mailsign {}", env!("CARGO_PKG_VERSION"));
                process::exit(0);
            }
            "-c" | "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("missing value for option {}", arg))?;
                opts.config_file = Some(path.into());
            }
            "--check" => {
                opts.check = true;
            }
            other => return Err(anyhow!("unrecognized option: {:?}\n\n{}", other, USAGE)),
        }
    }

    Ok(opts)
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
