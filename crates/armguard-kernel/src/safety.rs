//! [`SafetySupervisor`] – the single authority over [`SafetyState`].
//!
//! The supervisor watches every telemetry sample (it registers itself as a
//! [`TelemetryObserver`]) and drives one arm-wide state machine:
//!
//! ```text
//!             temp > warning                grace elapsed, still > warning
//!   Nominal ─────────────────▶ Warning ──────────────────────────────▶ Cooling
//!      ▲                          │ temp ≤ warning                        │
//!      └──────────────────────────┘                                       │
//!      ▲            temp ≤ warning − margin                               │
//!      └──────────────────────────────────────────────────────────────────┤
//!                                       temp ≥ critical or deadline passed ▼
//!                    current > ceiling (from anywhere) ──▶ EmergencyStopped
//! ```
//!
//! A critical reading outside `Cooling` walks through every intermediate
//! state within the same observation, so the transition log never skips a
//! state and the arm still stops at once.
//!
//! With a [`CalibrationTable`] attached through
//! [`SafetySupervisor::watch_ranges`], a joint within `range_margin` of its
//! calibrated limits raises `Warning { reason: NearRangeLimit }`. Entering
//! `Cooling` scales the hot joint's torque limit by `cooling_torque_factor`.
//!
//! Entering `EmergencyStopped` disables torque on every joint through the bus
//! worker's urgent lane. The state is left only through [`SafetySupervisor::reset`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use armguard_hal::{BusError, BusHandle, Register, TelemetryMonitor, TelemetryObserver};
use armguard_memory::CalibrationTable;
use armguard_middleware::EventBus;
use armguard_types::{
    ArmError, EventPayload, JointId, SENSOR_MAX, SafetyState, TelemetrySample, WarningReason,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

const SOURCE: &str = "armguard-kernel::safety";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyThresholds {
    pub warning_c: f32,
    pub critical_c: f32,
    /// Cooling ends once the joint is this far below `warning_c`.
    pub cooldown_margin_c: f32,
    /// Every joint must be below this before an emergency stop may be reset.
    pub reset_temperature_c: f32,
    pub current_ceiling_ma: u32,
    pub warning_grace_ms: u64,
    pub max_cooling_ms: u64,
    pub transition_log_capacity: usize,
    /// Raw units from a calibrated limit that count as "near" it.
    pub range_margin: i32,
    /// Applied to the hot joint's `TorqueLimit` on entering `Cooling`.
    pub cooling_torque_factor: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            warning_c: 40.0,
            critical_c: 50.0,
            cooldown_margin_c: 5.0,
            reset_temperature_c: 35.0,
            current_ceiling_ma: 1200,
            warning_grace_ms: 1000,
            max_cooling_ms: 120_000,
            transition_log_capacity: 64,
            range_margin: 57,
            cooling_torque_factor: 0.5,
        }
    }
}

impl SafetyThresholds {
    pub fn warning_grace(&self) -> Duration {
        Duration::from_millis(self.warning_grace_ms)
    }

    pub fn max_cooling(&self) -> Duration {
        Duration::from_millis(self.max_cooling_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyTransition {
    pub from: SafetyState,
    pub to: SafetyState,
    pub at: Instant,
    pub cause: String,
}

/// Outcome of a bus-wide torque disable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyStopReport {
    pub disabled: Vec<JointId>,
    pub unreachable: Vec<JointId>,
}

/// Running counters for the safety report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyStats {
    pub warnings: u64,
    pub cooling_episodes: u64,
    pub current_trips: u64,
    pub emergency_stops: u64,
    pub max_temperature_c: BTreeMap<JointId, f32>,
}

struct Inner {
    state: SafetyState,
    warning_since: Option<Instant>,
    log: VecDeque<SafetyTransition>,
    last_temperature: HashMap<JointId, f32>,
    stats: SafetyStats,
}

impl Inner {
    fn enter(&mut self, to: SafetyState, at: Instant, cause: &str, capacity: usize) -> SafetyTransition {
        let transition = SafetyTransition {
            from: self.state,
            to,
            at,
            cause: cause.to_string(),
        };
        match to {
            SafetyState::Warning { .. } => {
                self.stats.warnings += 1;
                self.warning_since = Some(at);
            }
            SafetyState::Cooling { .. } => self.stats.cooling_episodes += 1,
            SafetyState::EmergencyStopped => self.stats.emergency_stops += 1,
            SafetyState::Nominal => {}
        }
        if !matches!(to, SafetyState::Warning { .. }) {
            self.warning_since = None;
        }
        self.state = to;
        while self.log.len() >= capacity.max(1) {
            self.log.pop_front();
        }
        self.log.push_back(transition.clone());
        transition
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetySupervisor
// ────────────────────────────────────────────────────────────────────────────

pub struct SafetySupervisor {
    bus: BusHandle,
    telemetry: Arc<TelemetryMonitor>,
    joints: Vec<JointId>,
    thresholds: SafetyThresholds,
    events: EventBus,
    ranges: RwLock<Option<Arc<CalibrationTable>>>,
    inner: Mutex<Inner>,
}

impl SafetySupervisor {
    /// Build a supervisor for `joints` and subscribe it to `telemetry`.
    pub fn attach(
        bus: BusHandle,
        telemetry: Arc<TelemetryMonitor>,
        joints: Vec<JointId>,
        thresholds: SafetyThresholds,
        events: EventBus,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            bus,
            telemetry: Arc::clone(&telemetry),
            joints,
            thresholds,
            events,
            ranges: RwLock::new(None),
            inner: Mutex::new(Inner {
                state: SafetyState::Nominal,
                warning_since: None,
                log: VecDeque::new(),
                last_temperature: HashMap::new(),
                stats: SafetyStats::default(),
            }),
        });
        telemetry.subscribe(&supervisor);
        supervisor
    }

    pub fn state(&self) -> SafetyState {
        self.inner.lock().state
    }

    pub fn thresholds(&self) -> &SafetyThresholds {
        &self.thresholds
    }

    /// Warn when a joint comes close to the limits committed in `table`.
    pub fn watch_ranges(&self, table: Arc<CalibrationTable>) {
        *self.ranges.write() = Some(table);
    }

    fn near_range_limit(&self, sample: &TelemetrySample) -> bool {
        let ranges = self.ranges.read();
        let Some(record) = ranges.as_ref().and_then(|table| table.get(sample.joint)) else {
            return false;
        };
        if record.span() >= SENSOR_MAX {
            return false;
        }
        let margin = self.thresholds.range_margin;
        sample.position <= record.range_min + margin || sample.position >= record.range_max - margin
    }

    /// `true` when `joint` may be moved right now.
    ///
    /// Enforces the cooling deadline, then takes a fresh sample so the
    /// decision reflects the joint's present temperature and current. Any
    /// communication failure answers `false`.
    pub fn check(&self, joint: JointId) -> bool {
        self.tick(Instant::now());
        if !self.state().allows_motion() {
            return false;
        }
        match self.telemetry.sample(joint) {
            Ok(_) => self.state().allows_motion(),
            Err(err) => {
                warn!(joint = %joint, error = %err, "safety check could not sample joint");
                false
            }
        }
    }

    /// Fold one sample into the state machine.
    pub fn observe(&self, sample: &TelemetrySample) {
        let thresholds = &self.thresholds;
        let capacity = thresholds.transition_log_capacity;
        let joint = sample.joint;
        let temp = sample.temperature_c;
        let now = sample.timestamp;
        let near_limit = self.near_range_limit(sample);
        let mut transitions = Vec::new();

        {
            let mut inner = self.inner.lock();
            inner.last_temperature.insert(joint, temp);
            let max = inner.stats.max_temperature_c.entry(joint).or_insert(temp);
            if temp > *max {
                *max = temp;
            }

            if inner.state.is_emergency_stopped() {
                return;
            }

            if sample.current_ma > thresholds.current_ceiling_ma {
                inner.stats.current_trips += 1;
                let cause = format!(
                    "joint {joint} drew {} mA (ceiling {} mA)",
                    sample.current_ma, thresholds.current_ceiling_ma
                );
                transitions.push(inner.enter(SafetyState::EmergencyStopped, now, &cause, capacity));
            } else {
                let cooling = SafetyState::Cooling {
                    joint,
                    until: now + thresholds.max_cooling(),
                };
                let critical = temp >= thresholds.critical_c;
                let critical_cause = format!("joint {joint} at {temp:.1} °C (critical)");

                let current = inner.state;
                match current {
                    SafetyState::Nominal if critical => {
                        let warning = SafetyState::Warning {
                            joint,
                            reason: WarningReason::Temperature,
                        };
                        transitions.push(inner.enter(warning, now, &critical_cause, capacity));
                        transitions.push(inner.enter(cooling, now, &critical_cause, capacity));
                        transitions.push(inner.enter(
                            SafetyState::EmergencyStopped,
                            now,
                            &critical_cause,
                            capacity,
                        ));
                    }
                    SafetyState::Nominal if temp > thresholds.warning_c => {
                        let warning = SafetyState::Warning {
                            joint,
                            reason: WarningReason::Temperature,
                        };
                        let cause = format!("joint {joint} at {temp:.1} °C");
                        transitions.push(inner.enter(warning, now, &cause, capacity));
                    }
                    SafetyState::Nominal if near_limit => {
                        let warning = SafetyState::Warning {
                            joint,
                            reason: WarningReason::NearRangeLimit,
                        };
                        let cause = format!("joint {joint} at {} near a calibrated limit", sample.position);
                        transitions.push(inner.enter(warning, now, &cause, capacity));
                    }
                    SafetyState::Warning { .. } if critical => {
                        transitions.push(inner.enter(cooling, now, &critical_cause, capacity));
                        transitions.push(inner.enter(
                            SafetyState::EmergencyStopped,
                            now,
                            &critical_cause,
                            capacity,
                        ));
                    }
                    SafetyState::Warning {
                        reason: WarningReason::NearRangeLimit,
                        ..
                    } if temp > thresholds.warning_c => {
                        let warning = SafetyState::Warning {
                            joint,
                            reason: WarningReason::Temperature,
                        };
                        let cause = format!("joint {joint} at {temp:.1} °C");
                        transitions.push(inner.enter(warning, now, &cause, capacity));
                    }
                    SafetyState::Warning {
                        joint: warned,
                        reason: WarningReason::NearRangeLimit,
                    } if warned == joint && !near_limit => {
                        let cause = format!("joint {joint} back inside its range margin");
                        transitions.push(inner.enter(SafetyState::Nominal, now, &cause, capacity));
                    }
                    SafetyState::Warning {
                        joint: warned,
                        reason: WarningReason::Temperature,
                    } if warned == joint => {
                        if temp <= thresholds.warning_c {
                            let cause = format!("joint {joint} back to {temp:.1} °C");
                            transitions.push(inner.enter(SafetyState::Nominal, now, &cause, capacity));
                        } else if inner
                            .warning_since
                            .is_some_and(|since| now.saturating_duration_since(since) >= thresholds.warning_grace())
                        {
                            let cause = format!("joint {joint} still at {temp:.1} °C after grace period");
                            transitions.push(inner.enter(cooling, now, &cause, capacity));
                        }
                    }
                    SafetyState::Cooling { .. } if critical => {
                        transitions.push(inner.enter(
                            SafetyState::EmergencyStopped,
                            now,
                            &critical_cause,
                            capacity,
                        ));
                    }
                    SafetyState::Cooling { until, .. } if now >= until => {
                        transitions.push(inner.enter(
                            SafetyState::EmergencyStopped,
                            now,
                            "cooling deadline exceeded",
                            capacity,
                        ));
                    }
                    SafetyState::Cooling { joint: cooling_joint, .. }
                        if cooling_joint == joint
                            && temp <= thresholds.warning_c - thresholds.cooldown_margin_c =>
                    {
                        let cause = format!("joint {joint} cooled to {temp:.1} °C");
                        transitions.push(inner.enter(SafetyState::Nominal, now, &cause, capacity));
                    }
                    _ => {}
                }
            }
        }

        self.settle(transitions);
    }

    /// Enforce the cooling deadline without waiting for a sample.
    pub fn tick(&self, now: Instant) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                SafetyState::Cooling { until, .. } if now >= until => Some(inner.enter(
                    SafetyState::EmergencyStopped,
                    now,
                    "cooling deadline exceeded",
                    self.thresholds.transition_log_capacity,
                )),
                _ => None,
            }
        };
        self.settle(transition.into_iter().collect());
    }

    /// Log and publish transitions, and cut torque if the arm just stopped
    /// or reduce it if a joint started cooling.
    fn settle(&self, transitions: Vec<SafetyTransition>) {
        let mut stopped = false;
        let mut cooling = None;
        for t in &transitions {
            match t.to {
                SafetyState::EmergencyStopped => {
                    error!(from = %t.from, cause = %t.cause, "EMERGENCY STOP");
                    stopped = true;
                }
                SafetyState::Cooling { joint, .. } => {
                    warn!(from = %t.from, to = %t.to, cause = %t.cause, "safety state changed");
                    cooling = Some(joint);
                }
                SafetyState::Nominal => info!(from = %t.from, cause = %t.cause, "safety state nominal"),
                _ => warn!(from = %t.from, to = %t.to, cause = %t.cause, "safety state changed"),
            }
            self.events.emit(
                SOURCE,
                EventPayload::SafetyTransition {
                    from: t.from.to_string(),
                    to: t.to.to_string(),
                    joint: t.to.joint().or(t.from.joint()),
                },
            );
        }
        if stopped {
            self.disable_all_torque();
        } else if let Some(joint) = cooling {
            self.reduce_torque(joint);
        }
    }

    fn reduce_torque(&self, joint: JointId) {
        let factor = self.thresholds.cooling_torque_factor.clamp(0.0, 1.0);
        let reduced = self.bus.read(joint, Register::TorqueLimit).and_then(|limit| {
            let reduced = (f64::from(limit) * factor) as i32;
            self.bus
                .write(joint, Register::TorqueLimit, reduced)
                .map(|()| (limit, reduced))
        });
        match reduced {
            Ok((from, to)) => info!(joint = %joint, from, to, "torque limit reduced while cooling"),
            Err(err) => warn!(joint = %joint, error = %err, "could not reduce torque limit"),
        }
    }

    /// Stop the arm: enter `EmergencyStopped` and disable torque on every joint.
    ///
    /// Always succeeds at the software level; joints that do not answer are
    /// listed in the report. Calling it again re-sends the torque-off writes
    /// and leaves the state unchanged.
    #[instrument(skip(self))]
    pub fn emergency_stop(&self, cause: &str) -> EmergencyStopReport {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state.is_emergency_stopped() {
                None
            } else {
                Some(inner.enter(
                    SafetyState::EmergencyStopped,
                    Instant::now(),
                    cause,
                    self.thresholds.transition_log_capacity,
                ))
            }
        };
        if let Some(t) = transition {
            error!(from = %t.from, cause, "EMERGENCY STOP requested");
            self.events.emit(
                SOURCE,
                EventPayload::SafetyTransition {
                    from: t.from.to_string(),
                    to: t.to.to_string(),
                    joint: t.from.joint(),
                },
            );
        }
        self.disable_all_torque()
    }

    fn disable_all_torque(&self) -> EmergencyStopReport {
        let mut report = EmergencyStopReport::default();
        for &joint in &self.joints {
            match self.bus.write_urgent(joint, Register::TorqueEnable, 0) {
                Ok(()) => report.disabled.push(joint),
                Err(err) => {
                    error!(joint = %joint, error = %err, "could not disable torque");
                    report.unreachable.push(joint);
                }
            }
        }
        self.events.emit(
            SOURCE,
            EventPayload::EmergencyStop {
                disabled: report.disabled.clone(),
                unreachable: report.unreachable.clone(),
            },
        );
        report
    }

    /// Leave `EmergencyStopped` once every joint has cooled below
    /// `reset_temperature_c`. Torque stays disabled.
    ///
    /// # Errors
    ///
    /// [`ArmError::ResetRefused`] when the arm is not stopped, or when any
    /// joint is still warm or has no temperature reading.
    pub fn reset(&self) -> Result<(), ArmError> {
        if !self.state().is_emergency_stopped() {
            return Err(ArmError::ResetRefused("arm is not emergency-stopped".to_string()));
        }
        for &joint in &self.joints {
            // Refresh readings; the observer path records the temperature.
            if let Err(err) = self.telemetry.sample(joint) {
                warn!(joint = %joint, error = %err, "could not refresh temperature before reset");
            }
        }

        let mut inner = self.inner.lock();
        for &joint in &self.joints {
            match inner.last_temperature.get(&joint) {
                None => {
                    return Err(ArmError::ResetRefused(format!(
                        "no temperature reading for joint {joint}"
                    )));
                }
                Some(&temp) if temp >= self.thresholds.reset_temperature_c => {
                    return Err(ArmError::ResetRefused(format!(
                        "joint {joint} still at {temp:.1} °C (limit {:.1} °C)",
                        self.thresholds.reset_temperature_c
                    )));
                }
                Some(_) => {}
            }
        }
        let t = inner.enter(
            SafetyState::Nominal,
            Instant::now(),
            "external reset",
            self.thresholds.transition_log_capacity,
        );
        drop(inner);

        info!("emergency stop reset; torque remains disabled");
        self.events.emit(
            SOURCE,
            EventPayload::SafetyTransition {
                from: t.from.to_string(),
                to: t.to.to_string(),
                joint: None,
            },
        );
        Ok(())
    }

    /// Transition log, oldest first.
    pub fn transitions(&self) -> Vec<SafetyTransition> {
        self.inner.lock().log.iter().cloned().collect()
    }

    pub fn stats(&self) -> SafetyStats {
        self.inner.lock().stats.clone()
    }

    pub fn last_temperature(&self, joint: JointId) -> Option<f32> {
        self.inner.lock().last_temperature.get(&joint).copied()
    }
}

impl TelemetryObserver for SafetySupervisor {
    fn on_sample(&self, sample: &TelemetrySample) {
        self.observe(sample);
    }

    fn on_read_failure(&self, joint: JointId, error: &BusError) {
        warn!(joint = %joint, error = %error, "joint did not answer telemetry read");
    }
}
