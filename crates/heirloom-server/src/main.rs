//! Heirloom Server: headless daemon for check-in sweeps and vault unlocks
//!
//! Runs the maintenance side of the vault library crates: the missed check-in
//! sweep, pending unlocks, and notification delivery.
//!
//! # Usage
//!
//! ```bash
//! heirloom-server --config /path/to/heirloom-server.toml
//! heirloom-server --once      # Run one maintenance cycle and exit
//! heirloom-server --validate  # Validate config and exit
//! ```

mod config;
mod daemon;

use anyhow::{Context, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    // Key material must never reach a core file
    heirloom_core::memory::disable_core_dumps();

    // SMTP over TLS needs a process-wide rustls provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/config/heirloom-server.toml");
    let mut one_shot = false;
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--once" => {
                one_shot = true;
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("heirloom-server {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut server_config = config::ServerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    server_config.apply_env_overrides();

    server_config
        .validate()
        .context("Configuration validation failed")?;

    std::env::set_var("RUST_LOG", &server_config.server.log_level);
    env_logger::init();

    if validate_only {
        let policy = &server_config.policy;
        println!("Configuration is valid.");
        println!("  Database:       {}", server_config.db_path().display());
        println!("  Keys dir:       {}", server_config.keyring.keys_dir.display());
        println!(
            "  Escrow key:     {}",
            server_config.keyring.escrow_passphrase.is_some()
        );
        println!(
            "  Sweep interval: {} secs",
            server_config.server.sweep_interval_secs
        );
        println!("  Workers:        {}", server_config.server.workers);
        println!(
            "  Policy:         every {} days, escalate after {} missed, {} day window, {} day grace",
            policy.check_in_interval_days,
            policy.escalation_threshold,
            policy.quorum_window_days,
            policy.grace_period_days
        );
        println!(
            "  Lead days:      {:?}",
            server_config.notifications.lead_days
        );
        println!(
            "  Email notify:   {}",
            server_config.notifications.email.is_some()
        );
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    let daemon = daemon::Daemon::new(&server_config).context("Failed to start daemon")?;

    if one_shot {
        log::info!("Running single maintenance cycle…");
        rt.block_on(daemon.run_cycle())?;
        log::info!("Done.");
    } else {
        let shutdown = rt.block_on(async {
            tokio::select! {
                result = daemon.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received shutdown signal. Exiting…");
                    Ok(())
                }
            }
        });

        if let Err(e) = shutdown {
            log::error!("Server error: {:#}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"Heirloom Server: headless check-in and unlock daemon

USAGE:
    heirloom-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/heirloom-server.toml)
    --once                Run a single maintenance cycle and exit
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    HEIRLOOM_DATA_DIR            Data directory path
    HEIRLOOM_SWEEP_INTERVAL      Seconds between maintenance cycles
    HEIRLOOM_WORKERS             Parallel check-in sweep workers
    HEIRLOOM_LOG_LEVEL           Log level (error/warn/info/debug/trace)
    HEIRLOOM_KEYS_DIR            Holder key directory
    HEIRLOOM_ESCROW_PASSPHRASE   Passphrase for the escrow holder key

EXAMPLES:
    # Run as daemon with config file
    heirloom-server --config /path/to/config.toml

    # Single cycle (useful for cron jobs)
    heirloom-server --config config.toml --once

    # Validate configuration
    heirloom-server --config config.toml --validate
"#
    );
}
