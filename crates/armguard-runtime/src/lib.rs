//! `armguard-runtime` – calibration, drift supervision and the arm facade.
//!
//! # Modules
//!
//! - [`calibrator`] – [`JointCalibrator`][calibrator::JointCalibrator]:
//!   the per-joint limit-discovery state machine. Runs one joint at a time
//!   under reduced torque, pauses whenever the safety supervisor refuses
//!   motion and commits a [`CalibrationRecord`][armguard_types::CalibrationRecord]
//!   into the shared table.
//! - [`drift`] – [`DriftMonitor`][drift::DriftMonitor]: trailing-window drift
//!   checks against the committed calibration, homing-offset compensation
//!   and the advisory health score.
//! - [`service`] – [`ArmService`][service::ArmService]: connects a bus
//!   transport and wires every component together. This is the only surface
//!   the motion layer talks to.
//! - [`config`] – [`ArmConfig`][config::ArmConfig]: every tunable in one
//!   serde tree.
//! - [`logging`] – [`init_tracing`][logging::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter.
//!
//! # Safety authority
//!
//! Nothing in this crate decides whether the arm may move. The calibrator
//! asks the [`SafetySupervisor`][armguard_kernel::SafetySupervisor] before
//! every step, and the health score is advisory only.

pub mod calibrator;
pub mod config;
pub mod drift;
pub mod logging;
pub mod service;

pub use calibrator::{CalibrationConfig, CalibrationPhase, JointCalibrator};
pub use config::{ArmConfig, WatchdogConfig};
pub use drift::{DriftConfig, DriftMonitor, DriftReport};
pub use logging::{TracerProviderGuard, init_tracing};
pub use service::{ArmService, ArmStatus};
