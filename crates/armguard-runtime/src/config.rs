//! [`ArmConfig`] – every tunable of one arm in a single serde tree.
//!
//! Settle times, step sizes and thresholds depend on the actuator model and
//! are meant to be tuned per installation, so none of them is a constant.
//! Each section falls back to its own defaults when omitted.

use std::time::Duration;

use armguard_hal::{BusConfig, TelemetryConfig};
use armguard_kernel::{SafetyThresholds, StallConfig};
use serde::{Deserialize, Serialize};

use crate::calibrator::CalibrationConfig;
use crate::drift::DriftConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    pub bus: BusConfig,
    pub telemetry: TelemetryConfig,
    pub stall: StallConfig,
    pub safety: SafetyThresholds,
    pub calibration: CalibrationConfig,
    pub drift: DriftConfig,
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// A joint with no sample for this long is reported stale.
    pub telemetry_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            telemetry_timeout_ms: 1_000,
        }
    }
}

impl WatchdogConfig {
    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }
}
