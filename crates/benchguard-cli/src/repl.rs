//! REPL – Read-Eval-Print Loop for the BenchGuard operator console.
//!
//! Supported slash-commands:
//!   /help                     – show this list
//!   /status                   – emergency stop, connections, locks, sessions
//!   /lock <eq>                – take the exclusive lock
//!   /observe <eq>             – take an observer lock
//!   /renew <eq>               – extend the exclusive lease
//!   /release <eq>             – drop whatever lock this session holds
//!   /connect <eq>             – connect and seed from current readings
//!   /disconnect <eq>          – safe disconnect
//!   /set <eq> <param> <value> – submit a setpoint (voltage/current/power/resistance/output)
//!   /estop                    – engage the emergency stop
//!   /resume                   – lift the emergency stop (outputs stay off)
//!   /force-release <eq>       – administrative lock teardown
//!   /events <eq>              – safety events as JSON lines
//!   /quit | /exit             – close the session and exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use benchguard_kernel::BenchGate;
use benchguard_types::{BenchError, EquipmentId, LockMode, Parameter, SafetyAction, SessionId};
use tokio::runtime::Runtime;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Lock(EquipmentId),
    Observe(EquipmentId),
    Renew(EquipmentId),
    Release(EquipmentId),
    Connect(EquipmentId),
    Disconnect(EquipmentId),
    Set {
        equipment: EquipmentId,
        parameter: Parameter,
        value: f64,
    },
    EmergencyStop,
    Resume,
    ForceRelease(EquipmentId),
    Events(EquipmentId),
    Quit,
    /// Known command, wrong arguments.
    Usage(&'static str),
    Unknown(String),
}

/// Parse one trimmed, non-empty line.
pub fn parse(line: &str) -> Command {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Command::Unknown(String::new());
    };
    let args: Vec<&str> = words.collect();

    let equipment = |usage: &'static str, make: fn(EquipmentId) -> Command| match args.as_slice() {
        [eq] => make(EquipmentId::new(*eq)),
        _ => Command::Usage(usage),
    };

    match cmd {
        "/help" => Command::Help,
        "/status" => Command::Status,
        "/lock" => equipment("/lock <eq>", Command::Lock),
        "/observe" => equipment("/observe <eq>", Command::Observe),
        "/renew" => equipment("/renew <eq>", Command::Renew),
        "/release" => equipment("/release <eq>", Command::Release),
        "/connect" => equipment("/connect <eq>", Command::Connect),
        "/disconnect" => equipment("/disconnect <eq>", Command::Disconnect),
        "/force-release" => equipment("/force-release <eq>", Command::ForceRelease),
        "/events" => equipment("/events <eq>", Command::Events),
        "/set" => match args.as_slice() {
            [eq, parameter, value] => match (parameter.parse::<Parameter>(), value.parse::<f64>()) {
                (Ok(parameter), Ok(value)) => Command::Set {
                    equipment: EquipmentId::new(*eq),
                    parameter,
                    value,
                },
                _ => Command::Usage("/set <eq> <voltage|current|power|resistance|output> <number>"),
            },
            _ => Command::Usage("/set <eq> <param> <value>"),
        },
        "/estop" => Command::EmergencyStop,
        "/resume" => Command::Resume,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(rt: &Runtime, gate: &Arc<BenchGate>, session: &SessionId, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let prompt = if gate.is_emergency_stop_active() {
            "benchguard[ESTOP]>".bold().red()
        } else {
            "benchguard>".bold().cyan()
        };
        print!("{} ", prompt);
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Command::Help => cmd_help(),
            Command::Status => cmd_status(rt, gate, session),
            Command::Lock(eq) => report(gate.acquire_exclusive(&eq, session, None), |lease| {
                println!("{} exclusive lock on {} until {}", "✓".green(), eq.to_string().bold(), lease.expires_at);
            }),
            Command::Observe(eq) => report(gate.acquire_observer(&eq, session), |lease| {
                println!("{} observing {} until {}", "✓".green(), eq.to_string().bold(), lease.expires_at);
            }),
            Command::Renew(eq) => report(gate.renew(&eq, session, None), |lease| {
                println!("{} lease on {} extended to {}", "✓".green(), eq.to_string().bold(), lease.expires_at);
            }),
            Command::Release(eq) => report(gate.release(&eq, session), |released| {
                if released {
                    println!("{} released {}", "✓".green(), eq.to_string().bold());
                } else {
                    println!("  {} held no lock on {}", "·".dimmed(), eq);
                }
            }),
            Command::Connect(eq) => report(rt.block_on(gate.connect(&eq)), |()| {
                println!("{} {} connected", "✓".green(), eq.to_string().bold());
            }),
            Command::Disconnect(eq) => report(rt.block_on(gate.disconnect(&eq, session)), |()| {
                println!("{} {} disconnected", "✓".green(), eq.to_string().bold());
            }),
            Command::Set {
                equipment,
                parameter,
                value,
            } => report(
                rt.block_on(gate.submit_command(&equipment, session, parameter, value)),
                |outcome| match outcome.action {
                    SafetyAction::Limited => println!(
                        "{} {} {} → {} (slew-limited toward {})",
                        "~".yellow().bold(),
                        equipment.to_string().bold(),
                        parameter,
                        outcome.approved.to_string().yellow(),
                        outcome.requested
                    ),
                    _ => println!(
                        "{} {} {} → {}",
                        "✓".green(),
                        equipment.to_string().bold(),
                        parameter,
                        outcome.approved.to_string().green()
                    ),
                },
            ),
            Command::EmergencyStop => cmd_estop(rt, gate),
            Command::Resume => {
                if rt.block_on(gate.deactivate_emergency_stop()) {
                    println!(
                        "{} emergency stop lifted; outputs remain off until re-enabled",
                        "✓".green()
                    );
                } else {
                    println!("  {} emergency stop was not active", "·".dimmed());
                }
            }
            Command::ForceRelease(eq) => report(gate.force_release(&eq), |n| {
                println!("{} {} lease(s) on {} torn down", "⚠".yellow().bold(), n, eq.to_string().bold());
            }),
            Command::Events(eq) => {
                let events = gate.safety_events(&eq);
                if events.is_empty() {
                    println!("  {} no safety events for {}", "·".dimmed(), eq);
                }
                for event in events {
                    match serde_json::to_string(&event) {
                        Ok(json) => println!("{json}"),
                        Err(e) => println!("{}: {}", "Encode error".red(), e),
                    }
                }
            }
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Command::Usage(usage) => println!("{} {}", "Usage:".yellow(), usage.bold()),
            Command::Unknown(other) => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "BenchGuard Commands".bold().underline());
    println!("  {}                     – bench overview", "/status".bold().cyan());
    println!("  {}  – exclusive / observer lock", "/lock <eq>  /observe <eq>".bold().cyan());
    println!("  {}  – extend / drop your lock", "/renew <eq>  /release <eq>".bold().cyan());
    println!("  {}  – bring equipment on/offline", "/connect <eq>  /disconnect <eq>".bold().cyan());
    println!("  {}   – submit a setpoint", "/set <eq> <param> <value>".bold().cyan());
    println!("  {}            – engage / lift emergency stop", "/estop  /resume".bold().cyan());
    println!("  {}         – tear down all leases", "/force-release <eq>".bold().cyan());
    println!("  {}                – safety event log", "/events <eq>".bold().cyan());
    println!("  {}              – exit the console", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(rt: &Runtime, gate: &BenchGate, session: &SessionId) {
    let estop = gate.emergency_stop_status();
    println!("{}", "Bench Status".bold().underline());
    if estop.active {
        println!(
            "  Emergency stop : {} since {}",
            "ACTIVE".red().bold(),
            estop
                .activated_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        );
    } else {
        println!("  Emergency stop : {}", "inactive".green());
    }
    if !estop.stopped.is_empty() {
        let ids: Vec<String> = estop.stopped.iter().map(|id| id.to_string()).collect();
        println!("  Last stopped   : {}", ids.join(", ").yellow());
    }

    for lock in gate.lock_states() {
        let connected = match rt.block_on(gate.is_connected(&lock.equipment)) {
            Ok(true) => "connected".green(),
            Ok(false) => "offline".dimmed(),
            Err(_) => "unknown".red(),
        };
        let holder = match &lock.exclusive {
            Some(lease) if &lease.session == session => "you".bold().green().to_string(),
            Some(lease) => lease.session.to_string(),
            None => "-".to_string(),
        };
        let mode = match lock.mode {
            LockMode::Exclusive => "exclusive".yellow(),
            LockMode::Observer => "observed".cyan(),
            LockMode::Unlocked => "unlocked".dimmed(),
        };
        println!(
            "  {:<8} {:<10} {:<10} holder {}  observers {}",
            lock.equipment.to_string().bold(),
            connected,
            mode,
            holder,
            lock.observers.len()
        );
    }
    println!("  Sessions       : {}", gate.sessions().len());
}

fn cmd_estop(rt: &Runtime, gate: &BenchGate) {
    let report = rt.block_on(gate.activate_emergency_stop());
    if report.already_active {
        println!("  {} emergency stop already active", "·".dimmed());
        return;
    }
    println!("{}", "EMERGENCY STOP ENGAGED".red().bold());
    for id in &report.stopped {
        match report.failures.iter().find(|f| &f.equipment == id) {
            Some(failure) => println!("  {} {} – {}", "✗".red().bold(), id.to_string().bold(), failure.details),
            None => println!("  {} {} output off", "✓".green(), id.to_string().bold()),
        }
    }
    if report.stopped.is_empty() {
        println!("  {} no outputs were enabled", "·".dimmed());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn report<T>(result: Result<T, BenchError>, on_ok: impl FnOnce(T)) {
    match result {
        Ok(value) => on_ok(value),
        Err(e) => println!("{} {}", "✗".red().bold(), e.to_string().red()),
    }
}
