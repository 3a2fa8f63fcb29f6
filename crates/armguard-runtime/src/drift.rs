//! [`DriftMonitor`] – long-running comparison of live behavior against the
//! committed calibration, plus the advisory per-joint health score.
//!
//! Drift is judged on resting samples only (a moving joint spreads its
//! positions by definition):
//!
//! | Measure              | Definition                                       | Flags drift when |
//! |----------------------|--------------------------------------------------|------------------|
//! | `position_spread`    | max − min resting position in the window         | `> 50`           |
//! | `temperature_rise`   | latest − min temperature in the window           | `> 5 °C`         |
//! | `center_discrepancy` | mean position − expected center of the record    | `\|d\| > 100`    |
//!
//! A flagged discrepancy can be compensated by rewriting the homing offset.
//! Ranges are never touched here; shifting them takes a full calibration
//! session. Repeated drift, or a calibration that has simply grown old, only
//! marks the joint for recalibration. Nothing in this module moves the arm.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use armguard_hal::TelemetryMonitor;
use armguard_memory::CalibrationTable;
use armguard_middleware::EventBus;
use armguard_types::{ArmError, ArmLayout, EventPayload, HealthScore, JointId, TelemetrySample};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const SOURCE: &str = "armguard-runtime::drift";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Trailing window the drift measures are computed over.
    pub window_ms: u64,
    pub min_samples: usize,
    pub position_spread_threshold: i32,
    pub temperature_rise_threshold_c: f32,
    /// Center discrepancy beyond which the offset is worth correcting.
    pub compensation_threshold: i32,
    pub recalibration_after_drifts: u32,
    pub max_calibration_age_s: u64,
    pub health_temperature_c: f32,
    pub health_current_ma: u32,
    pub health_load: u16,
    pub sustained_temperature_c: f32,
    pub sustained_samples: usize,
    pub check_interval_ms: u64,
    pub auto_compensate: bool,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            min_samples: 3,
            position_spread_threshold: 50,
            temperature_rise_threshold_c: 5.0,
            compensation_threshold: 100,
            recalibration_after_drifts: 3,
            max_calibration_age_s: 3_600,
            health_temperature_c: 45.0,
            health_current_ma: 1_000,
            health_load: 800,
            sustained_temperature_c: 40.0,
            sustained_samples: 10,
            check_interval_ms: 5_000,
            auto_compensate: false,
        }
    }
}

impl DriftConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn max_calibration_age(&self) -> Duration {
        Duration::from_secs(self.max_calibration_age_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    pub joint: JointId,
    pub drift: bool,
    /// Fewer resting samples than `min_samples`; nothing was judged.
    pub insufficient_data: bool,
    pub samples: usize,
    pub position_spread: i32,
    pub temperature_rise: f32,
    pub mean_position: f64,
    /// `None` when the joint has no calibration to compare against.
    pub center_discrepancy: Option<i32>,
    pub recalibration_recommended: bool,
}

impl DriftReport {
    fn empty(joint: JointId, samples: usize) -> Self {
        Self {
            joint,
            drift: false,
            insufficient_data: true,
            samples,
            position_spread: 0,
            temperature_rise: 0.0,
            mean_position: 0.0,
            center_discrepancy: None,
            recalibration_recommended: false,
        }
    }
}

/// Compute the drift measures over `window`.
///
/// `expected_center` is the raw reading the joint's record says it should
/// rest around, if it has one.
pub fn analyse(
    config: &DriftConfig,
    joint: JointId,
    window: &[TelemetrySample],
    expected_center: Option<i32>,
) -> DriftReport {
    let resting: Vec<&TelemetrySample> = window.iter().filter(|s| !s.moving).collect();
    let (Some(first), Some(latest)) = (resting.first(), resting.last()) else {
        return DriftReport::empty(joint, 0);
    };
    if resting.len() < config.min_samples.max(1) {
        return DriftReport::empty(joint, resting.len());
    }

    let (mut min_pos, mut max_pos) = (first.position, first.position);
    let mut min_temp = first.temperature_c;
    let mut sum = 0_i64;
    for s in &resting {
        min_pos = min_pos.min(s.position);
        max_pos = max_pos.max(s.position);
        min_temp = min_temp.min(s.temperature_c);
        sum += i64::from(s.position);
    }
    let mean_position = sum as f64 / resting.len() as f64;
    let position_spread = max_pos - min_pos;
    let temperature_rise = latest.temperature_c - min_temp;
    let center_discrepancy = expected_center.map(|c| (mean_position - f64::from(c)).round() as i32);

    let drift = position_spread > config.position_spread_threshold
        || temperature_rise > config.temperature_rise_threshold_c
        || center_discrepancy.is_some_and(|d| d.abs() > config.compensation_threshold);

    DriftReport {
        joint,
        drift,
        insufficient_data: false,
        samples: resting.len(),
        position_spread,
        temperature_rise,
        mean_position,
        center_discrepancy,
        recalibration_recommended: false,
    }
}

/// Score `recent` telemetry (oldest first) out of 100.
pub fn score(config: &DriftConfig, recent: &[TelemetrySample]) -> HealthScore {
    let Some(latest) = recent.last() else {
        return HealthScore::MAX;
    };
    let mut score = 100;
    if latest.temperature_c > config.health_temperature_c {
        score -= 20;
    }
    if latest.current_ma > config.health_current_ma {
        score -= 15;
    }
    if latest.load > config.health_load {
        score -= 10;
    }
    let tail = &recent[recent.len().saturating_sub(config.sustained_samples)..];
    if tail.len() >= config.sustained_samples.max(1) {
        let mean = tail.iter().map(|s| s.temperature_c).sum::<f32>() / tail.len() as f32;
        if mean > config.sustained_temperature_c {
            score -= 10;
        }
    }
    HealthScore::new(score)
}

// ────────────────────────────────────────────────────────────────────────────
// DriftMonitor
// ────────────────────────────────────────────────────────────────────────────

pub struct DriftMonitor {
    telemetry: Arc<TelemetryMonitor>,
    table: Arc<CalibrationTable>,
    layout: ArmLayout,
    events: EventBus,
    config: DriftConfig,
    /// Consecutive drifted checks per joint.
    streaks: Mutex<HashMap<JointId, u32>>,
}

impl DriftMonitor {
    pub fn new(
        telemetry: Arc<TelemetryMonitor>,
        table: Arc<CalibrationTable>,
        layout: ArmLayout,
        events: EventBus,
        config: DriftConfig,
    ) -> Self {
        Self {
            telemetry,
            table,
            layout,
            events,
            config,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    fn expected_center(&self, joint: JointId) -> Result<Option<i32>, ArmError> {
        let descriptor = self.layout.get(joint).ok_or(ArmError::UnknownJoint(joint))?;
        Ok(self
            .table
            .get(joint)
            .map(|record| record.expected_center(descriptor.center)))
    }

    /// Measure drift over the trailing window without recording anything.
    pub fn analyse(&self, joint: JointId) -> Result<DriftReport, ArmError> {
        let expected = self.expected_center(joint)?;
        let window = self.telemetry.history(joint, self.config.window());
        Ok(analyse(&self.config, joint, &window, expected))
    }

    /// Measure drift and fold the result into the joint's drift streak.
    ///
    /// A flagged joint is logged and announced on the event bus. Drift is
    /// advisory: it never fails the call and never stops the arm.
    pub fn check_drift(&self, joint: JointId) -> Result<DriftReport, ArmError> {
        let mut report = self.analyse(joint)?;
        if report.insufficient_data {
            debug!(joint = %joint, samples = report.samples, "not enough resting samples for drift check");
            return Ok(report);
        }

        let streak = {
            let mut streaks = self.streaks.lock();
            if report.drift {
                let streak = streaks.entry(joint).or_insert(0);
                *streak += 1;
                *streak
            } else {
                streaks.remove(&joint);
                0
            }
        };
        let stale = self
            .table
            .age(joint)
            .is_some_and(|age| age > self.config.max_calibration_age());
        report.recalibration_recommended =
            streak >= self.config.recalibration_after_drifts.max(1) || stale;

        if report.drift {
            warn!(
                joint = %joint,
                position_spread = report.position_spread,
                temperature_rise = report.temperature_rise,
                center_discrepancy = ?report.center_discrepancy,
                streak,
                "drift detected"
            );
            self.events.emit(
                SOURCE,
                EventPayload::DriftDetected {
                    joint,
                    position_spread: report.position_spread,
                    temperature_rise: report.temperature_rise,
                    center_discrepancy: report.center_discrepancy.unwrap_or(0),
                },
            );
        }
        if report.recalibration_recommended {
            warn!(joint = %joint, streak, stale, "recalibration recommended");
        }
        Ok(report)
    }

    /// Rewrite the joint's homing offset so its expected center matches
    /// where it actually rests.
    ///
    /// Applies only when drift is flagged and the center discrepancy exceeds
    /// `compensation_threshold`. Returns `(old, new)` offsets when applied.
    pub fn compensate(&self, joint: JointId) -> Result<Option<(i32, i32)>, ArmError> {
        let report = self.analyse(joint)?;
        self.apply_compensation(&report)
    }

    fn apply_compensation(&self, report: &DriftReport) -> Result<Option<(i32, i32)>, ArmError> {
        let joint = report.joint;
        let Some(discrepancy) = report.center_discrepancy else {
            return Ok(None);
        };
        if !report.drift || discrepancy.abs() <= self.config.compensation_threshold {
            return Ok(None);
        }
        let descriptor = self.layout.get(joint).ok_or(ArmError::UnknownJoint(joint))?;
        let new_offset = report.mean_position.round() as i32 - descriptor.center;
        let old_offset = self.table.set_homing_offset(joint, new_offset)?;

        info!(joint = %joint, old_offset, new_offset, discrepancy, "homing offset compensated");
        self.events.emit(
            SOURCE,
            EventPayload::HomingCompensated {
                joint,
                old_offset,
                new_offset,
            },
        );
        Ok(Some((old_offset, new_offset)))
    }

    pub fn health_score(&self, joint: JointId) -> HealthScore {
        let recent = self
            .telemetry
            .recent(joint, self.config.sustained_samples.max(1));
        score(&self.config, &recent)
    }

    pub fn health_report(&self) -> BTreeMap<JointId, HealthScore> {
        self.layout
            .ids()
            .into_iter()
            .map(|joint| (joint, self.health_score(joint)))
            .collect()
    }

    /// Check every calibrated joint, compensating flagged offsets when
    /// `auto_compensate` is set.
    pub fn run_checks(&self, auto_compensate: bool) -> Vec<DriftReport> {
        let mut reports = Vec::new();
        for joint in self.table.snapshot().into_keys() {
            let report = match self.check_drift(joint) {
                Ok(report) => report,
                Err(err) => {
                    warn!(joint = %joint, error = %err, "drift check failed");
                    continue;
                }
            };
            if auto_compensate
                && let Err(err) = self.apply_compensation(&report)
            {
                warn!(joint = %joint, error = %err, "drift compensation failed");
            }
            reports.push(report);
        }
        reports
    }
}
