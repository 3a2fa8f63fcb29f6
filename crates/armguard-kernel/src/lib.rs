//! `armguard-kernel` – Safety enforcement
//!
//! Decides, from live telemetry, whether a joint is pushing against
//! something and whether the arm may move at all. Nothing above this layer
//! is allowed to second-guess it.
//!
//! # Modules
//!
//! - [`stall`] – [`StallDetector`][stall::StallDetector]: per-joint baseline
//!   current and the dual-condition stall test with two-read confirmation.
//! - [`safety`] – [`SafetySupervisor`][safety::SafetySupervisor]: the
//!   arm-wide [`SafetyState`][armguard_types::SafetyState] machine,
//!   temperature and current ceilings, and the bus-wide emergency stop.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: flags joints whose
//!   telemetry has gone silent.

pub mod safety;
pub mod stall;
pub mod watchdog;

pub use safety::{EmergencyStopReport, SafetyStats, SafetySupervisor, SafetyThresholds, SafetyTransition};
pub use stall::{StallConfig, StallDetector, StallDiagnostics, StallTrigger, StallVerdict};
pub use watchdog::{JointHealth, Watchdog};
