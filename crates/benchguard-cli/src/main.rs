//! `benchguard-cli` – BenchGuard operator console
//!
//! This binary is a hands-on front end for the safety core.  It:
//!
//! 1. Loads `~/.benchguard/config.toml`, writing a default one on first run.
//! 2. Builds a simulated bench (`psu-1` power supply, `load-1` electronic
//!    load) behind a [`BenchGate`] and opens an operator session.
//! 3. Drops the operator into an **interactive REPL** with slash-commands
//!    (`/lock`, `/connect`, `/set`, `/estop`, `/status`, `/help`, …).
//! 4. Intercepts **Ctrl-C** to engage the emergency stop before exiting.

mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use benchguard_hal::SimBench;
use benchguard_kernel::{BenchConfig, BenchGate, config};

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the filter (default "info").  BENCHGUARD_LOG_FORMAT=json
    // switches to newline-delimited JSON.  Operator-facing output stays on
    // println!.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("BENCHGUARD_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match BenchConfig::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = BenchConfig::default();
            match cfg.save() {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg.apply_env_overrides();
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = BenchConfig::default();
            cfg.apply_env_overrides();
            cfg
        }
    };

    // ── Runtime & bench ───────────────────────────────────────────────────
    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    let gate = Arc::new(BenchGate::new(cfg));
    for sim in SimBench::builder()
        .with_power_supply("psu-1")
        .with_load("load-1")
        .build()
    {
        gate.register_instrument(sim);
    }
    let identity = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
    let session = gate.open_session(identity);

    let _sweeper = {
        let _guard = rt.enter();
        gate.spawn_sweeper()
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let gate_ctrlc = Arc::clone(&gate);
    let handle = rt.handle().clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – engaging emergency stop …".yellow().bold());

        let report = handle.block_on(gate_ctrlc.activate_emergency_stop());
        println!(
            "  {} Emergency stop active; {} output(s) disabled.",
            "✓".green(),
            report.stopped.len().saturating_sub(report.failures.len())
        );
        for failure in &report.failures {
            println!(
                "  {} {} did not confirm: {}",
                "✗".red().bold(),
                failure.equipment.to_string().bold(),
                failure.details
            );
        }
        println!("{}", "  ✓ Exiting BenchGuard.".green());

        shutdown_clone.store(true, Ordering::SeqCst);
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not engage the emergency stop");
    }

    println!(
        "  Bench: {}   Session: {}",
        gate.equipment()
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
            .bold(),
        session.id.to_string().dimmed()
    );
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&rt, &gate, &session.id, shutdown);

    if let Err(e) = gate.close_session(&session.id) {
        warn!(error = %e, "session already closed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___                 _      ___                     _ "#.bold().cyan());
    println!("{}", r#"  | _ ) ___ _ _  __ __| |_   / __|_  _ __ _ _ _ __ _| |"#.bold().cyan());
    println!("{}", r#"  | _ \/ -_) ' \/ _/ _| ' \ | (_ | || / _` | '_/ _` |_|"#.bold().cyan());
    println!("{}", r#"  |___/\___|_||_\__\__|_||_| \___|\_,_\__,_|_| \__,_(_)"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "BenchGuard".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Lab equipment safety gate");
    println!();
}
