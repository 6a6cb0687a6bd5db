//! `armlink-cli` – headless teleoperation and recording runner.
//!
//! This binary wires a simulated arm to a WebSocket teleoperation device and
//! runs the real-time control loop until Ctrl-C.  It:
//!
//! 1. Installs structured logging (`RUST_LOG`, `ARMLINK_LOG_FORMAT=json`,
//!    optional OTLP export via `OTEL_EXPORTER_OTLP_ENDPOINT`).
//! 2. Loads `armlink.toml` (first argument, `ARMLINK_CONFIG`, or the working
//!    directory), falling back to the reference scene defaults.
//! 3. Validates the configuration and binds every joint, site and actuator
//!    name; any failure exits with status 2 before the loop starts.
//! 4. Intercepts **Ctrl-C** to stop the loop after the current cycle and
//!    prints the run statistics.

mod config;

use std::process::ExitCode;

use colored::Colorize;
use tracing::{error, info, warn};

use armlink_hal::LoggingSink;
use armlink_hal::sim::{SimArm, SimCameraRig};
use armlink_runtime::{LoopStats, Session, init_tracing};
use armlink_teleop::WsTransport;

/// Synthetic depth plane distance for the simulated cameras, in metres.
const SIM_CAMERA_DEPTH: f32 = 1.0;

fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    let _tracing = init_tracing("armlink");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let path = config::config_path(std::env::args().nth(1));
    let cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            println!(
                "  No config at {}; using the reference scene.",
                path.display().to_string().dimmed()
            );
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        println!("{}: {}", "Config error".red(), e);
        return ExitCode::from(2);
    }

    // ── Session ───────────────────────────────────────────────────────────
    let rig = cfg
        .cameras
        .iter()
        .fold(SimCameraRig::new(cfg.camera_width, cfg.camera_height), |rig, name| {
            rig.with_camera(name.clone(), SIM_CAMERA_DEPTH)
        });
    let transport = WsTransport::on_port(cfg.teleop_port);

    let mut session = match Session::build(
        SimArm::seven_dof(),
        &cfg.session_config(),
        transport,
        Box::new(rig),
        Box::new(LoggingSink::new()),
    ) {
        Ok(session) => session,
        Err(e) if e.is_fatal() => {
            error!(error = %e, "startup aborted");
            println!("{}: {}", "Startup failed".red().bold(), e);
            return ExitCode::from(2);
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            println!("{}: {}", "Startup failed".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let stop = session.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the control loop …".yellow().bold());
        stop.stop();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the loop can only be stopped by killing the process");
    }

    if cfg.run_policy {
        println!("  Mode: {}", "policy".bold());
    } else {
        println!(
            "  Teleop device: {}",
            format!("ws://<host>:{}", cfg.teleop_port).bold().cyan()
        );
    }
    println!(
        "  Recording: {}\n",
        if cfg.record { "on".green() } else { "off".dimmed() }
    );

    info!(dt = cfg.dt, record = cfg.record, run_policy = cfg.run_policy, "control loop starting");
    let stats = session.run();
    print_stats(&stats);
    ExitCode::SUCCESS
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __ _ _ __ _ __ ___ | (_)_ __ | | __"#.bold().cyan());
    println!("{}", r#"  / _` | '__| '_ ` _ \| | | '_ \| |/ /"#.bold().cyan());
    println!("{}", r#" | (_| | |  | | | | | | | | | | |   < "#.bold().cyan());
    println!("{}", r#"  \__,_|_|  |_| |_| |_|_|_|_| |_|_|\_\"#.bold().cyan());
    println!();
    println!("  {} {}",
        "armlink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Teleoperated arm control and demonstration capture");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Summary
// ─────────────────────────────────────────────────────────────────────────────

fn print_stats(stats: &LoopStats) {
    println!();
    println!("  {}", "Run summary".bold());
    println!("    cycles           {}", stats.cycles);
    let misses = stats.deadline_misses.to_string();
    println!(
        "    deadline misses  {}",
        if stats.deadline_misses > 0 { misses.yellow() } else { misses.normal() }
    );
    println!("    singular cycles  {}", stats.singular_cycles);
    let failed = stats.failed_cycles.to_string();
    println!(
        "    failed cycles    {}",
        if stats.failed_cycles > 0 { failed.red() } else { failed.normal() }
    );
    println!("    frames captured  {}", stats.frames_captured);
    if stats.sink_errors > 0 {
        println!("    sink errors      {}", stats.sink_errors.to_string().red());
    }
    println!();
}
