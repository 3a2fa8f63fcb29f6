//! `armguard-cli` – operator shell for a supervised arm.
//!
//! This binary:
//!
//! 1. Loads `~/.armguard/config.toml`, writing the defaults on first run.
//! 2. Opens the calibration database and connects an [`ArmService`] to the
//!    simulated SO-101 bus.
//! 3. Starts background monitoring (telemetry poller, cooling deadline, drift
//!    checks) unless disabled in the config.
//! 4. Drops the operator into an **interactive REPL** with slash-commands
//!    (`/calibrate`, `/status`, `/health`, `/drift`, `/estop`, …).
//! 5. Intercepts **Ctrl-C** to emergency-stop the arm before exiting.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::warn;

use armguard_hal::SimBus;
use armguard_memory::{CalibrationStore, CalibrationTable};
use armguard_middleware::EventBus;
use armguard_runtime::{ArmService, init_tracing};
use armguard_types::ArmLayout;

fn main() {
    // RUST_LOG filters (default "info"); ARMGUARD_LOG_FORMAT=json switches to
    // JSON; OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let _tracing = init_tracing("armguard");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let table = open_table(&cfg);
    println!(
        "  Arm {} – {} joint(s) calibrated on record",
        cfg.arm_id.bold(),
        table.len()
    );

    let service = match ArmService::connect(
        SimBus::so101(),
        ArmLayout::so101(),
        cfg.arm.clone(),
        table,
        EventBus::default(),
    ) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            println!("{}: {}", "Could not connect to arm".red().bold(), e);
            std::process::exit(1);
        }
    };

    let status = service.status();
    if status.missing.is_empty() {
        println!("  Bus scan     : {}", "all joints answered".green());
    } else {
        println!(
            "  Bus scan     : {} {:?}",
            "missing joints".red(),
            status.missing.iter().map(|j| j.0).collect::<Vec<_>>()
        );
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let ctrlc_service = Arc::clone(&service);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – emergency stop …".yellow().bold());
        let report = ctrlc_service.emergency_stop("operator Ctrl-C");
        println!(
            "{}",
            format!(
                "  ✓ Torque disabled on {} joint(s), {} unreachable.",
                report.disabled.len(),
                report.unreachable.len()
            )
            .green()
        );
        println!("{}", "  ✓ Exiting armguard.".green());
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not emergency-stop the arm");
    }

    if cfg.monitor_on_start {
        match service.start_monitoring() {
            Ok(()) => println!("  Monitoring   : {}", "on".green()),
            Err(e) => println!("  Monitoring   : {} ({})", "failed".red(), e),
        }
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let shutdown = AtomicBool::new(false);
    repl::run(&service, &shutdown);

    service.stop_monitoring();
    match Arc::try_unwrap(service) {
        Ok(service) => service.shutdown(),
        Err(_) => warn!("arm service still shared at exit; leaving shutdown to drop"),
    }
}

fn first_run() -> config::Config {
    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

/// The persistent table when the database opens, an in-memory one otherwise.
fn open_table(cfg: &config::Config) -> Arc<CalibrationTable> {
    let persistent = CalibrationStore::open(&cfg.db_path)
        .map_err(armguard_types::ArmError::from)
        .and_then(|store| CalibrationTable::with_store(cfg.arm_id.clone(), Arc::new(store)));
    match persistent {
        Ok(table) => Arc::new(table),
        Err(e) => {
            println!(
                "{}: {} – calibration will not be saved",
                "Database error".red(),
                e
            );
            Arc::new(CalibrationTable::new(cfg.arm_id.clone()))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __ _ _ __ _ __ ___   __ _ _   _  __ _ _ __ __| |"#.bold().cyan());
    println!("{}", r#"  / _` | '__| '_ ` _ \ / _` | | | |/ _` | '__/ _` |"#.bold().cyan());
    println!("{}", r#" | (_| | |  | | | | | | (_| | |_| | (_| | | | (_| |"#.bold().cyan());
    println!("{}", r#"  \__,_|_|  |_| |_| |_|\__, |\__,_|\__,_|_|  \__,_|"#.bold().cyan());
    println!("{}", r#"                       |___/                       "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "armguard".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Auto-calibration & safety supervisor for serial-bus arms");
    println!();
}
