//! `servolink-cli` – operator shell for a 31-joint robot.
//!
//! This binary:
//!
//! 1. Loads `~/.servolink/config.toml` (or `--config PATH`), writing the
//!    defaults on first run, then applies `SERVOLINK_*` environment and
//!    command-line overrides.
//! 2. Initialises the transport context on the selected domain and brings up
//!    the service client, telemetry monitors and the command loop, plus an
//!    in-process simulated robot with `--sim`.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/init`, `/torque`, `/mode`, `/state`, `/target`, `/stats`, `/log`).
//! 4. Intercepts **Ctrl-C** to stop streaming commands and exit cleanly.
//!
//! Exit code is 0 on clean shutdown and 1 when setup fails.

mod config;
mod repl;
mod station;

use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use servolink_runtime::init_tracing;
use servolink_types::LinkError;

use crate::config::Config;
use crate::station::Station;

#[derive(Parser, Debug)]
#[command(name = "servolink")]
#[command(about = "Typed pub/sub link and real-time command loop for a 31-joint robot")]
#[command(version)]
struct Cli {
    /// Transport domain; overrides the config file and SERVOLINK_DOMAIN_ID
    domain_id: Option<u32>,

    /// Run an in-process simulated robot on the same domain
    #[arg(long)]
    sim: bool,

    /// Config file to use instead of ~/.servolink/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Control loop period in microseconds
    #[arg(long, value_name = "N")]
    period_us: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG selects the level (default "info"); SERVOLINK_LOG_FORMAT=json
    // switches to newline-delimited JSON. User-facing output stays on println!.
    let _tracing = init_tracing("servolink");

    print_banner();

    let cfg = match resolve_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::from(1);
        }
    };

    let station = match Station::bring_up(&cfg, cli.sim) {
        Ok(station) => Arc::new(station),
        Err(e) => {
            error!(error = %e, "station bring-up failed");
            println!("{}: {}", "Initialization failed".red(), e);
            return ExitCode::from(1);
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    // The REPL is blocked on stdin, so the handler finishes the shutdown
    // itself and exits the process.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    let station_ctrlc = Arc::clone(&station);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
        station_ctrlc.shutdown();
        println!("{}", "  ✓ Command stream stopped.".green());
        println!("{}", "  ✓ Exiting servolink.".green());
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    print_status(&cfg, &station, cli.sim);
    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    repl::run(&station, shutdown);
    station.shutdown();
    ExitCode::SUCCESS
}

/// File, then environment, then command-line flags.
fn resolve_config(cli: &Cli) -> Result<Config, LinkError> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let path = config::config_path();
            if !path.exists() {
                write_first_run_config(&path);
            }
            path
        }
    };

    let mut cfg = config::load_or_default(&path).map_err(LinkError::Config)?;
    if let Some(domain_id) = cli.domain_id {
        cfg.domain_id = domain_id;
    }
    if let Some(period_us) = cli.period_us {
        cfg.period_us = period_us;
    }
    cfg.validate()?;
    println!("  Config loaded from {}", path.display().to_string().bold());
    Ok(cfg)
}

fn write_first_run_config(path: &std::path::Path) {
    match config::save_to(&Config::default(), path) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            path.display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____                   __ _      __  "#.bold().cyan());
    println!("{}", r#"  / __/__ _____  _____  / /(_)__  / /__"#.bold().cyan());
    println!("{}", r#" _\ \/ -_) __/ |/ / _ \/ // / _ \/  '_/"#.bold().cyan());
    println!("{}", r#"/___/\__/_/  |___/\___/_//_/_//_/_/\_\ "#.bold().cyan());
    println!();
    println!("  {} {}",
        "servolink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Typed pub/sub link for a 31-joint robot");
    println!();
}

fn print_status(cfg: &Config, station: &Station, sim: bool) {
    println!("  Domain        : {}", cfg.domain_id.to_string().yellow());
    println!("  Loop period   : {} µs", cfg.period_us.to_string().yellow());
    println!("  Service timeout: {} ms", cfg.service_timeout_ms.to_string().yellow());
    if sim {
        println!("  Robot         : {}", "simulated (in-process)".green());
    } else {
        println!("  Robot         : {}", "external peer".yellow());
    }
    if station.low_state.has_state() {
        println!("  Telemetry     : {}", "receiving".green());
    } else {
        println!("  Telemetry     : {}", "waiting for first state".dimmed());
    }
    println!();
}
