// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! sfbroker server
//!
//! # Usage
//!
//! ```bash
//! sfbroker 12345
//! sfbroker 12345 --bind 127.0.0.1 --log-level debug
//! sfbroker 12345 --config broker.json
//! ```
//!
//! Type `exit` on stdin (or press Ctrl+C) to stop.

use std::io::BufRead;
use std::net::IpAddr;
use std::path::PathBuf;
use std::thread;

use clap::{Parser, ValueEnum};
use sfbroker::{Broker, BrokerConfig, ConfigError, DeliveryPolicy, ShutdownHandle};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    FirstMatch,
    AnyStoreForward,
}

impl From<PolicyArg> for DeliveryPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FirstMatch => DeliveryPolicy::FirstMatch,
            PolicyArg::AnyStoreForward => DeliveryPolicy::AnyStoreForward,
        }
    }
}

/// Store-and-forward publish/subscribe broker (UDP in, TCP out)
#[derive(Parser, Debug)]
#[command(name = "sfbroker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for both the TCP listener and the UDP socket
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Bind address [default: 0.0.0.0, or the config file's]
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Configuration file (JSON format); command-line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store-and-forward selection when several patterns match
    #[arg(long, value_enum)]
    delivery_policy: Option<PolicyArg>,

    /// Do not read admin commands from stdin
    #[arg(long)]
    no_admin_stdin: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Watch stdin for `exit`; end of input also stops the broker.
fn spawn_admin_console(handle: ShutdownHandle) -> std::io::Result<()> {
    thread::Builder::new()
        .name("sfbroker-admin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim() == "exit" => break,
                    Ok(line) if !line.trim().is_empty() => {
                        warn!("unknown admin command {:?} (only \"exit\")", line.trim());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
            handle.shutdown();
        })?;
    Ok(())
}

/// Config file (or defaults) with command-line overrides applied.
fn build_config(args: &Args) -> Result<BrokerConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            BrokerConfig::from_file(path)?
        }
        None => BrokerConfig::default(),
    };
    config.port = args.port;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(policy) = args.delivery_policy {
        config.delivery_policy = policy.into();
    }
    if args.no_admin_stdin {
        config.admin_stdin = false;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&args)?;
    let mut broker = Broker::bind(config)?;
    let handle = broker.shutdown_handle();

    info!("+----------------------------------------------------+");
    info!("|  sfbroker v{:40} |", env!("CARGO_PKG_VERSION"));
    info!("+----------------------------------------------------+");
    info!("|  TCP:    {:41} |", broker.local_addr()?);
    info!("|  UDP:    {:41} |", broker.udp_addr()?);
    info!(
        "|  Policy: {:41} |",
        format!("{:?}", broker.config().delivery_policy)
    );
    info!("+----------------------------------------------------+");

    let ctrlc_handle = handle.clone();
    ctrlc::set_handler(move || {
        info!("Shutting down...");
        ctrlc_handle.shutdown();
    })?;

    if broker.config().admin_stdin {
        spawn_admin_console(handle)?;
    }

    broker.run()?;
    Ok(())
}
