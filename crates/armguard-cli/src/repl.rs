//! REPL – the armguard operator shell.
//!
//! Supported slash-commands:
//!   /help              – show this list
//!   /calibrate [ids]   – calibrate the given joints (all when omitted)
//!   /status            – safety state, bus presence, telemetry freshness
//!   /health            – advisory health score per joint
//!   /drift             – drift check of every calibrated joint
//!   /estop             – emergency stop
//!   /reset             – leave emergency stop once the arm has cooled
//!   /table             – dump the calibration table as JSON
//!   /quit | /exit      – exit the CLI

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use armguard_middleware::{Topic, TopicReceiver};
use armguard_runtime::ArmService;
use armguard_types::{EventPayload, JointId, SafetyState};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Calibrate(Vec<JointId>),
    Status,
    Health,
    Drift,
    Estop,
    Reset,
    Table,
    Quit,
}

/// Parse one input line. Errors carry the message to show the operator.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();
    let no_args = |cmd: Command| {
        if args.is_empty() {
            Ok(cmd)
        } else {
            Err(format!("{head} takes no arguments"))
        }
    };
    match head {
        "/help" => no_args(Command::Help),
        "/calibrate" => args
            .iter()
            .map(|a| {
                a.parse::<u8>()
                    .map(JointId)
                    .map_err(|_| format!("'{a}' is not a joint id"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Command::Calibrate),
        "/status" => no_args(Command::Status),
        "/health" => no_args(Command::Health),
        "/drift" => no_args(Command::Drift),
        "/estop" => no_args(Command::Estop),
        "/reset" => no_args(Command::Reset),
        "/table" => no_args(Command::Table),
        "/quit" | "/exit" => no_args(Command::Quit),
        other => Err(format!("Unknown command '{other}'")),
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(service: &ArmService, shutdown: &AtomicBool) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut safety_events = service.events().subscribe_to(Topic::Safety);
    let mut health_events = service.events().subscribe_to(Topic::Health);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", prompt(service.safety_state()));
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
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Calibrate(joints)) => cmd_calibrate(service, &joints),
            Ok(Command::Status) => cmd_status(service),
            Ok(Command::Health) => cmd_health(service),
            Ok(Command::Drift) => cmd_drift(service),
            Ok(Command::Estop) => cmd_estop(service),
            Ok(Command::Reset) => cmd_reset(service),
            Ok(Command::Table) => cmd_table(service),
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }

        print_events(&mut safety_events);
        print_events(&mut health_events);
    }
}

fn prompt(state: SafetyState) -> String {
    let tag = match state {
        SafetyState::Nominal => "armguard>".bold().cyan(),
        SafetyState::Warning { .. } => "armguard[warning]>".bold().yellow(),
        SafetyState::Cooling { .. } => "armguard[cooling]>".bold().yellow(),
        SafetyState::EmergencyStopped => "armguard[E-STOP]>".bold().red(),
    };
    tag.to_string()
}

/// Show what happened in the background since the last command.
fn print_events(receiver: &mut TopicReceiver) {
    for event in receiver.drain() {
        let line = match event.payload {
            EventPayload::SafetyTransition { from, to, .. } => format!("safety: {from} → {to}"),
            EventPayload::EmergencyStop {
                disabled,
                unreachable,
            } => format!(
                "emergency stop: torque off on {} joint(s), {} unreachable",
                disabled.len(),
                unreachable.len()
            ),
            EventPayload::DriftDetected { joint, .. } => format!("drift detected on joint {joint}"),
            EventPayload::HomingCompensated {
                joint,
                old_offset,
                new_offset,
            } => format!("joint {joint} homing offset {old_offset} → {new_offset}"),
            // Stall confirmations are routine during calibration.
            _ => continue,
        };
        println!("  {} {}", "•".yellow(), line.dimmed());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "armguard Commands".bold().underline());
    println!("  {}  – calibrate joints (all when no ids given)", "/calibrate [ids]".bold().cyan());
    println!("  {}            – safety state and bus presence", "/status".bold().cyan());
    println!("  {}            – advisory health score per joint", "/health".bold().cyan());
    println!("  {}             – drift check of calibrated joints", "/drift".bold().cyan());
    println!("  {}             – emergency stop (torque off)", "/estop".bold().cyan());
    println!("  {}             – clear emergency stop once cooled", "/reset".bold().cyan());
    println!("  {}             – dump the calibration table", "/table".bold().cyan());
    println!("  {}       – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_calibrate(service: &ArmService, joints: &[JointId]) {
    let label = if joints.is_empty() {
        "all joints".to_string()
    } else {
        joints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("  Calibrating {} …", label.bold());

    for (joint, result) in service.start_calibration_session(joints) {
        let name = service
            .layout()
            .get(joint)
            .map_or("?", |d| d.name.as_str());
        match result {
            Ok(record) => println!(
                "  {} joint {} ({}): offset {:+}, range [{}, {}]",
                "✓".green().bold(),
                joint,
                name,
                record.homing_offset,
                record.range_min,
                record.range_max
            ),
            Err(e) => println!("  {} joint {} ({}): {}", "✗".red().bold(), joint, name, e),
        }
    }
}

fn cmd_status(service: &ArmService) {
    let status = service.status();
    let state = match status.safety_state {
        SafetyState::Nominal => status.safety_state.to_string().green(),
        SafetyState::EmergencyStopped => status.safety_state.to_string().red().bold(),
        _ => status.safety_state.to_string().yellow(),
    };
    println!("{}", "Arm Status".bold().underline());
    println!("  Arm          : {}", status.arm_id.bold());
    println!("  Safety state : {}", state);
    println!("  Present      : {}", join(&status.present));
    if !status.missing.is_empty() {
        println!("  Missing      : {}", join(&status.missing).red());
    }
    if !status.stale.is_empty() {
        println!("  Stale        : {}", join(&status.stale).yellow());
    }
    println!("  Calibrated   : {}", join(&status.calibrated));
    println!("  Read failures: {}", status.read_failures);
    println!(
        "  Monitoring   : {}",
        if service.is_monitoring() { "on".green() } else { "off".dimmed() }
    );
    println!(
        "  Episodes     : {} warning(s), {} cooling, {} current trip(s), {} e-stop(s)",
        status.stats.warnings,
        status.stats.cooling_episodes,
        status.stats.current_trips,
        status.stats.emergency_stops
    );
    for (joint, max) in &status.stats.max_temperature_c {
        println!("  Max temp j{}  : {:.1} °C", joint, max);
    }
}

fn cmd_health(service: &ArmService) {
    println!("{}", "Joint Health".bold().underline());
    for (joint, score) in service.health_report() {
        let value = score.to_string();
        let value = match score.value() {
            80..=100 => value.green(),
            50..=79 => value.yellow(),
            _ => value.red(),
        };
        println!("  joint {} : {}", joint, value);
    }
}

fn cmd_drift(service: &ArmService) {
    let calibrated: Vec<JointId> = service.table().snapshot().into_keys().collect();
    if calibrated.is_empty() {
        println!("  {}", "No calibrated joints. Run /calibrate first.".dimmed());
        return;
    }
    println!("{}", "Drift Check".bold().underline());
    for joint in calibrated {
        match service.check_drift(joint) {
            Ok(report) if report.insufficient_data => {
                println!("  joint {} : {}", joint, "not enough resting samples".dimmed());
            }
            Ok(report) => {
                let verdict = if report.drift { "DRIFT".red().bold() } else { "ok".green() };
                println!(
                    "  joint {} : {} (spread {}, rise {:.1} °C, center {})",
                    joint,
                    verdict,
                    report.position_spread,
                    report.temperature_rise,
                    report
                        .center_discrepancy
                        .map_or("n/a".to_string(), |d| format!("{d:+}"))
                );
                if report.recalibration_recommended {
                    println!("           {}", "recalibration recommended".yellow());
                }
            }
            Err(e) => println!("  joint {} : {}", joint, e.to_string().red()),
        }
    }
}

fn cmd_estop(service: &ArmService) {
    let report = service.emergency_stop("operator /estop");
    println!(
        "{} torque disabled on {}",
        "EMERGENCY STOP".red().bold(),
        join(&report.disabled)
    );
    if !report.unreachable.is_empty() {
        println!("  {} {}", "Unreachable:".red(), join(&report.unreachable));
    }
}

fn cmd_reset(service: &ArmService) {
    match service.reset_emergency_stop() {
        Ok(()) => println!(
            "{} Safety state nominal. Torque stays off until the next command.",
            "✓".green().bold()
        ),
        Err(e) => println!("{}", e.to_string().red()),
    }
}

fn cmd_table(service: &ArmService) {
    match service.table().to_json() {
        Ok(json) => println!("{json}"),
        Err(e) => println!("{}", e.to_string().red()),
    }
}

fn join(joints: &[JointId]) -> String {
    if joints.is_empty() {
        return "none".to_string();
    }
    joints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse("/help"), Ok(Command::Help));
        assert_eq!(parse("  /status  "), Ok(Command::Status));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
        assert_eq!(parse("/estop"), Ok(Command::Estop));
    }

    #[test]
    fn calibrate_takes_joint_ids() {
        assert_eq!(parse("/calibrate"), Ok(Command::Calibrate(vec![])));
        assert_eq!(
            parse("/calibrate 1 3 6"),
            Ok(Command::Calibrate(vec![JointId(1), JointId(3), JointId(6)]))
        );
        assert!(parse("/calibrate 1 elbow").unwrap_err().contains("elbow"));
        assert!(parse("/calibrate 300").is_err());
    }

    #[test]
    fn rejects_unknown_and_extra_arguments() {
        assert!(parse("/launch").unwrap_err().contains("Unknown"));
        assert!(parse("/reset now").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn join_formats_joint_lists() {
        assert_eq!(join(&[]), "none");
        assert_eq!(join(&[JointId(1), JointId(4)]), "1, 4");
    }
}
