//! [`JointCalibrator`] – autonomous discovery of joint limits and homing.
//!
//! Each joint runs through a sensor-driven state machine, one joint at a
//! time because every joint shares the bus:
//!
//! ```text
//! Idle → TorqueArmed → SeekingLowerLimit → ReturnToOrigin → SeekingUpperLimit
//!      → Computed → Committed
//!                       (any state) → Aborted
//! ```
//!
//! Torque is armed at a deliberately weak limit so that pushing into a stop
//! cannot damage the mechanism. The joint is stepped towards each end until
//! the [`StallDetector`] confirms a stall, then backed off a couple of steps
//! and the limit recorded. From the two limits:
//!
//! - `center = (lower + upper).div_euclid(2)`
//! - `homing_offset = center − nominal_center`
//! - `range = [lower + margin, upper − margin]` (grippers: no inset)
//!
//! Continuous-rotation joints skip the search: their range is the full
//! sensor scale and the offset comes straight from the starting position.
//!
//! Before every step the [`SafetySupervisor`] is consulted. An unsafe arm
//! pauses the search (re-checked on a timer); an emergency stop aborts it.
//! A communication failure aborts the joint and disables its torque.

use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use armguard_hal::{BusHandle, Register, TelemetryMonitor};
use armguard_kernel::{SafetySupervisor, StallDetector, StallVerdict};
use armguard_memory::CalibrationTable;
use armguard_middleware::EventBus;
use armguard_types::{
    ArmError, ArmLayout, CalibrationFailure, CalibrationRecord, EventPayload, JointDescriptor,
    JointId, JointKind, SENSOR_MAX,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

const SOURCE: &str = "armguard-runtime::calibrator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub torque_limit_percent: u32,
    pub gripper_torque_limit_percent: u32,
    /// Position units per seek step.
    pub step_size: i32,
    /// Wait after each step before asking the stall detector.
    pub settle_ms: u64,
    /// Steps to retreat from a confirmed stall before recording the limit.
    pub backoff_steps: i32,
    pub max_travel: i32,
    pub gripper_max_travel: i32,
    pub safety_margin: i32,
    /// Intermediate goals of the S-curve used for larger moves.
    pub soft_start_steps: u32,
    pub soft_start_step_ms: u64,
    pub pause_recheck_ms: u64,
    pub max_pause_ms: u64,
    /// Disable torque once a joint is parked at its center.
    pub release_torque_after: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            torque_limit_percent: 30,
            gripper_torque_limit_percent: 20,
            step_size: 50,
            settle_ms: 100,
            backoff_steps: 2,
            max_travel: 3000,
            gripper_max_travel: 1500,
            safety_margin: 100,
            soft_start_steps: 10,
            soft_start_step_ms: 20,
            pause_recheck_ms: 500,
            max_pause_ms: 150_000,
            release_torque_after: false,
        }
    }
}

impl CalibrationConfig {
    fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    fn backoff(&self) -> i32 {
        self.backoff_steps * self.step_size
    }

    fn torque_limit(&self, kind: JointKind) -> i32 {
        let percent = match kind {
            JointKind::Gripper => self.gripper_torque_limit_percent,
            _ => self.torque_limit_percent,
        };
        (percent.min(100) * 10) as i32
    }

    fn travel_budget(&self, kind: JointKind) -> i32 {
        match kind {
            JointKind::Gripper => self.gripper_max_travel,
            _ => self.max_travel,
        }
    }
}

/// Where a joint's calibration run currently stands, with what it has
/// learned so far.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationPhase {
    Idle,
    TorqueArmed { start: i32 },
    SeekingLowerLimit { start: i32 },
    ReturnToOrigin { start: i32, lower: i32 },
    SeekingUpperLimit { start: i32, lower: i32 },
    Computed { record: CalibrationRecord },
    Committed { record: CalibrationRecord },
    Aborted { reason: CalibrationFailure },
}

impl CalibrationPhase {
    pub fn label(&self) -> &'static str {
        match self {
            CalibrationPhase::Idle => "idle",
            CalibrationPhase::TorqueArmed { .. } => "torque_armed",
            CalibrationPhase::SeekingLowerLimit { .. } => "seeking_lower_limit",
            CalibrationPhase::ReturnToOrigin { .. } => "return_to_origin",
            CalibrationPhase::SeekingUpperLimit { .. } => "seeking_upper_limit",
            CalibrationPhase::Computed { .. } => "computed",
            CalibrationPhase::Committed { .. } => "committed",
            CalibrationPhase::Aborted { .. } => "aborted",
        }
    }
}

/// One in-progress attempt, owned by the calibrator for its duration.
struct Attempt {
    joint: JointId,
    trace: Vec<CalibrationPhase>,
}

impl Attempt {
    fn new(joint: JointId) -> Self {
        Self {
            joint,
            trace: vec![CalibrationPhase::Idle],
        }
    }

    fn enter(&mut self, phase: CalibrationPhase) {
        let from = self.trace.last().map_or("idle", CalibrationPhase::label);
        info!(joint = %self.joint, from, to = phase.label(), "calibration phase");
        self.trace.push(phase);
    }
}

/// The limit to record after a stall confirmed at `stall_position` while
/// moving in `direction` (`-1` towards lower, `+1` towards upper).
pub fn backed_off_limit(stall_position: i32, direction: i32, backoff: i32) -> i32 {
    (stall_position - direction.signum() * backoff).clamp(0, SENSOR_MAX)
}

/// Turn two discovered limits into a record.
///
/// # Errors
///
/// [`CalibrationFailure::RangeTooNarrow`] when the limits leave no usable
/// range once the margin is applied.
pub fn compute_record(
    descriptor: &JointDescriptor,
    first: i32,
    second: i32,
    margin: i32,
) -> Result<CalibrationRecord, CalibrationFailure> {
    let (lower, upper) = (first.min(second), first.max(second));
    let (inset, required) = match descriptor.kind {
        JointKind::Gripper => (0, 2 * margin),
        _ => (margin, 4 * margin),
    };
    if upper - lower < required {
        return Err(CalibrationFailure::RangeTooNarrow {
            lower,
            upper,
            required,
        });
    }
    let center = (lower + upper).div_euclid(2);
    Ok(CalibrationRecord {
        homing_offset: center - descriptor.center,
        range_min: lower + inset,
        range_max: upper - inset,
        drive_mode: descriptor.direction,
    })
}

/// Intermediate goals of an S-curve move from `from` to `to`, ending at `to`.
pub fn soft_start_profile(from: i32, to: i32, steps: u32) -> Vec<i32> {
    let n = steps.max(1);
    (1..=n)
        .map(|k| {
            let s = 0.5 * (1.0 - (PI * f64::from(k) / f64::from(n)).cos());
            from + (f64::from(to - from) * s).round() as i32
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// JointCalibrator
// ────────────────────────────────────────────────────────────────────────────

pub struct JointCalibrator {
    bus: BusHandle,
    telemetry: Arc<TelemetryMonitor>,
    stall: Arc<StallDetector>,
    safety: Arc<SafetySupervisor>,
    table: Arc<CalibrationTable>,
    events: EventBus,
    config: CalibrationConfig,
    traces: Mutex<HashMap<JointId, Vec<CalibrationPhase>>>,
}

impl JointCalibrator {
    pub fn new(
        bus: BusHandle,
        telemetry: Arc<TelemetryMonitor>,
        stall: Arc<StallDetector>,
        safety: Arc<SafetySupervisor>,
        table: Arc<CalibrationTable>,
        events: EventBus,
        config: CalibrationConfig,
    ) -> Self {
        Self {
            bus,
            telemetry,
            stall,
            safety,
            table,
            events,
            config,
            traces: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Phase trace of the most recent attempt on `joint`.
    pub fn trace(&self, joint: JointId) -> Vec<CalibrationPhase> {
        self.traces.lock().get(&joint).cloned().unwrap_or_default()
    }

    /// Calibrate `joints` one after another, in the order given.
    ///
    /// The background poller is paused for the whole session. Each joint's
    /// baseline current is captured right before its own run. Once the arm
    /// is emergency-stopped every remaining joint is reported as aborted;
    /// records already committed are kept.
    pub fn run_session(
        &self,
        layout: &ArmLayout,
        joints: &[JointId],
    ) -> BTreeMap<JointId, Result<CalibrationRecord, ArmError>> {
        let _paused = self.telemetry.pause();
        let mut results = BTreeMap::new();
        info!(joints = joints.len(), "calibration session started");

        for &joint in joints {
            let result = if self.safety.state().is_emergency_stopped() {
                Err(ArmError::Calibration {
                    joint,
                    reason: CalibrationFailure::EmergencyStop,
                })
            } else {
                match layout.get(joint) {
                    None => Err(ArmError::Calibration {
                        joint,
                        reason: CalibrationFailure::JointMissing,
                    }),
                    Some(descriptor) => self.prepare_and_calibrate(descriptor),
                }
            };
            results.insert(joint, result);
        }

        let ok = results.values().filter(|r| r.is_ok()).count();
        info!(ok, failed = results.len() - ok, "calibration session finished");
        results
    }

    fn prepare_and_calibrate(
        &self,
        descriptor: &JointDescriptor,
    ) -> Result<CalibrationRecord, ArmError> {
        let joint = descriptor.id;
        if descriptor.kind != JointKind::ContinuousRotation {
            // Baseline capture energises the joint, so it is gated like any move.
            let baseline = self.wait_until_safe(joint).and_then(|()| {
                self.stall.calibrate_baseline_gated(&[joint], |j| {
                    self.wait_until_safe(j)?;
                    self.motion_allowed(j)
                })
            });
            if let Err(err) = baseline {
                let err = err.into_calibration(joint);
                self.report_failure(joint, &err);
                return Err(err);
            }
        }
        self.calibrate_joint(descriptor)
    }

    /// Run the full state machine for one joint and commit the result.
    ///
    /// # Errors
    ///
    /// [`ArmError::Calibration`] with the typed reason the joint aborted.
    #[instrument(skip(self, descriptor), fields(joint = %descriptor.id, kind = ?descriptor.kind))]
    pub fn calibrate_joint(
        &self,
        descriptor: &JointDescriptor,
    ) -> Result<CalibrationRecord, ArmError> {
        let joint = descriptor.id;
        let mut attempt = Attempt::new(joint);

        let original_limit = self.bus.read(joint, Register::TorqueLimit).ok();
        let outcome = self.drive(&mut attempt, descriptor);
        if let Some(limit) = original_limit
            && let Err(err) = self.bus.write(joint, Register::TorqueLimit, limit)
        {
            warn!(joint = %joint, error = %err, "could not restore torque limit");
        }

        let result = match outcome {
            Ok(record) => {
                self.events
                    .emit(SOURCE, EventPayload::CalibrationCommitted { joint, record });
                Ok(record)
            }
            Err(err) => {
                if matches!(err, ArmError::Communication { .. })
                    && let Err(e) = self.bus.write(joint, Register::TorqueEnable, 0)
                {
                    warn!(joint = %joint, error = %e, "could not disable torque after abort");
                }
                let err = err.into_calibration(joint);
                if let ArmError::Calibration { reason, .. } = &err {
                    attempt.enter(CalibrationPhase::Aborted {
                        reason: reason.clone(),
                    });
                }
                self.report_failure(joint, &err);
                Err(err)
            }
        };

        self.traces.lock().insert(joint, attempt.trace);
        result
    }

    fn report_failure(&self, joint: JointId, err: &ArmError) {
        error!(joint = %joint, error = %err, "calibration aborted");
        if let ArmError::Calibration { reason, .. } = err {
            self.events.emit(
                SOURCE,
                EventPayload::CalibrationFailed {
                    joint,
                    reason: reason.clone(),
                },
            );
        }
    }

    fn drive(
        &self,
        attempt: &mut Attempt,
        descriptor: &JointDescriptor,
    ) -> Result<CalibrationRecord, ArmError> {
        let joint = descriptor.id;
        self.wait_until_safe(joint)?;

        self.bus.write(
            joint,
            Register::TorqueLimit,
            self.config.torque_limit(descriptor.kind),
        )?;
        let start = self.bus.read(joint, Register::PresentPosition)?;
        self.bus.write(joint, Register::GoalPosition, start)?;
        self.arm_torque(joint)?;
        attempt.enter(CalibrationPhase::TorqueArmed { start });

        let record = if descriptor.kind == JointKind::ContinuousRotation {
            CalibrationRecord {
                homing_offset: start - descriptor.center,
                range_min: 0,
                range_max: SENSOR_MAX,
                drive_mode: descriptor.direction,
            }
        } else {
            let budget = self.config.travel_budget(descriptor.kind);

            attempt.enter(CalibrationPhase::SeekingLowerLimit { start });
            let lower = self.seek_limit(joint, start, -1, budget)?;

            attempt.enter(CalibrationPhase::ReturnToOrigin { start, lower });
            self.soft_move(joint, lower, start)?;

            attempt.enter(CalibrationPhase::SeekingUpperLimit { start, lower });
            let upper = self.seek_limit(joint, start, 1, budget)?;

            compute_record(descriptor, lower, upper, self.config.safety_margin).map_err(
                |reason| ArmError::Calibration { joint, reason },
            )?
        };
        attempt.enter(CalibrationPhase::Computed { record });

        self.table.commit(joint, record)?;
        attempt.enter(CalibrationPhase::Committed { record });
        info!(
            joint = %joint,
            homing_offset = record.homing_offset,
            range_min = record.range_min,
            range_max = record.range_max,
            "calibration committed"
        );

        self.park(descriptor, &record);
        Ok(record)
    }

    /// Move a freshly committed joint to its center. Failures are logged only:
    /// the record is already committed.
    fn park(&self, descriptor: &JointDescriptor, record: &CalibrationRecord) {
        let joint = descriptor.id;
        if descriptor.kind != JointKind::ContinuousRotation {
            let parked = self
                .telemetry
                .sample(joint)
                .and_then(|s| self.soft_move(joint, s.position, record.expected_center(descriptor.center)));
            if let Err(err) = parked {
                warn!(joint = %joint, error = %err, "could not park joint at center");
            }
        }
        if self.config.release_torque_after
            && let Err(err) = self.bus.write(joint, Register::TorqueEnable, 0)
        {
            warn!(joint = %joint, error = %err, "could not release torque");
        }
    }

    /// Step from `start` in `direction` until a stall is confirmed or the
    /// travel budget runs out. Returns the limit to record.
    fn seek_limit(
        &self,
        joint: JointId,
        start: i32,
        direction: i32,
        budget: i32,
    ) -> Result<i32, ArmError> {
        let step = self.config.step_size.max(1);
        let max_steps = (4 * budget / step).max(1);
        let mut steps = 0;
        let mut holding = false;
        self.stall.reset(joint);

        loop {
            self.wait_until_safe(joint)?;

            if !holding {
                let position = match self.telemetry.latest(joint) {
                    Some(sample) => sample.position,
                    None => self.telemetry.sample(joint)?.position,
                };
                let target = position + direction * step;
                if (position - start).abs() >= budget
                    || steps >= max_steps
                    || !(0..=SENSOR_MAX).contains(&target)
                {
                    warn!(
                        joint = %joint,
                        direction,
                        position,
                        steps,
                        "no physical limit found; using provisional limit"
                    );
                    return Ok(position);
                }
                self.bus.write(joint, Register::GoalPosition, target)?;
                steps += 1;
                debug!(joint = %joint, target, steps, "seek step");
            }
            thread::sleep(self.config.settle());

            match self.stall.observe(joint)? {
                StallVerdict::Confirmed { stall_position, .. } => {
                    let limit = backed_off_limit(stall_position, direction, self.config.backoff());
                    self.bus.write(joint, Register::GoalPosition, limit)?;
                    thread::sleep(self.config.settle());
                    info!(joint = %joint, stall_position, limit, "limit found");
                    return Ok(limit);
                }
                StallVerdict::Suspected { streak, .. } => {
                    debug!(joint = %joint, streak, "stall suspected; holding");
                    holding = true;
                }
                StallVerdict::Clear(_) => holding = false,
            }
        }
    }

    /// S-curve move, consulting the supervisor before each intermediate goal.
    fn soft_move(&self, joint: JointId, from: i32, to: i32) -> Result<(), ArmError> {
        let pause = Duration::from_millis(self.config.soft_start_step_ms);
        for goal in soft_start_profile(from, to, self.config.soft_start_steps) {
            self.wait_until_safe(joint)?;
            self.bus.write(joint, Register::GoalPosition, goal)?;
            thread::sleep(pause);
        }
        Ok(())
    }

    /// Enable torque on `joint`, re-reading the safety state immediately
    /// before the write.
    fn arm_torque(&self, joint: JointId) -> Result<(), ArmError> {
        loop {
            self.wait_until_safe(joint)?;
            match self.motion_allowed(joint) {
                Ok(()) => {
                    self.bus.write(joint, Register::TorqueEnable, 1)?;
                    return Ok(());
                }
                Err(ArmError::EmergencyStopped) => return Err(ArmError::EmergencyStopped),
                // Entered Cooling after the wait; wait again.
                Err(_) => {}
            }
        }
    }

    /// Current safety state as a go/no-go for energising `joint`, without
    /// touching the bus.
    fn motion_allowed(&self, joint: JointId) -> Result<(), ArmError> {
        let state = self.safety.state();
        if state.allows_motion() {
            Ok(())
        } else if state.is_emergency_stopped() {
            Err(ArmError::EmergencyStopped)
        } else {
            debug!(joint = %joint, state = %state, "torque enable refused");
            Err(ArmError::Calibration {
                joint,
                reason: CalibrationFailure::SafetyPauseTimeout { waited_ms: 0 },
            })
        }
    }

    /// Block until the supervisor allows motion of `joint`.
    ///
    /// Emergency stop aborts; a thermal pause is waited out up to
    /// `max_pause_ms`; a joint that stops answering surfaces its
    /// communication error.
    fn wait_until_safe(&self, joint: JointId) -> Result<(), ArmError> {
        let started = Instant::now();
        let max_pause = Duration::from_millis(self.config.max_pause_ms);
        let recheck = Duration::from_millis(self.config.pause_recheck_ms.max(1));
        let mut announced = false;

        loop {
            if self.safety.check(joint) {
                if announced {
                    info!(joint = %joint, waited_ms = started.elapsed().as_millis() as u64, "calibration resumed");
                }
                return Ok(());
            }

            let state = self.safety.state();
            if state.is_emergency_stopped() {
                return Err(ArmError::EmergencyStopped);
            }
            if state.allows_motion() {
                // The arm is fine but the joint did not answer.
                self.telemetry.sample(joint)?;
                continue;
            }

            let waited = started.elapsed();
            if waited >= max_pause {
                return Err(ArmError::Calibration {
                    joint,
                    reason: CalibrationFailure::SafetyPauseTimeout {
                        waited_ms: waited.as_millis() as u64,
                    },
                });
            }
            if !announced {
                warn!(joint = %joint, state = %state, "calibration paused by safety supervisor");
                announced = true;
            }
            thread::sleep(recheck.min(max_pause - waited));
            // The poller is paused for the session; feed the supervisor the
            // hot joint's temperature ourselves.
            if let Some(hot) = state.joint()
                && let Err(err) = self.telemetry.sample(hot)
            {
                debug!(joint = %hot, error = %err, "could not sample cooling joint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armguard_hal::{BusConfig, BusWorker, SimBus, SimController, SimJoint, TelemetryConfig};
    use armguard_kernel::{SafetyThresholds, StallConfig};
    use armguard_middleware::Topic;
    use armguard_types::{Direction, SENSOR_CENTER};

    struct Rig {
        _worker: BusWorker,
        ctl: SimController,
        layout: ArmLayout,
        safety: Arc<SafetySupervisor>,
        table: Arc<CalibrationTable>,
        calibrator: JointCalibrator,
        events: EventBus,
    }

    fn fast_config() -> CalibrationConfig {
        CalibrationConfig {
            settle_ms: 0,
            soft_start_step_ms: 0,
            pause_recheck_ms: 5,
            max_pause_ms: 60,
            ..CalibrationConfig::default()
        }
    }

    fn rig(sim: SimBus, layout: ArmLayout, config: CalibrationConfig) -> Rig {
        let ctl = sim.controller();
        let worker = BusWorker::spawn(sim, BusConfig::default()).unwrap();
        let bus = worker.handle();
        let events = EventBus::default();
        let telemetry = Arc::new(TelemetryMonitor::new(
            bus.clone(),
            layout.ids(),
            TelemetryConfig::default(),
        ));
        let safety = SafetySupervisor::attach(
            bus.clone(),
            Arc::clone(&telemetry),
            layout.ids(),
            SafetyThresholds::default(),
            events.clone(),
        );
        let stall = Arc::new(StallDetector::new(
            bus.clone(),
            Arc::clone(&telemetry),
            events.clone(),
            StallConfig {
                baseline_settle_ms: 0,
                baseline_read_interval_ms: 0,
                ..StallConfig::default()
            },
        ));
        let table = Arc::new(CalibrationTable::new("test-arm"));
        let calibrator = JointCalibrator::new(
            bus,
            telemetry,
            stall,
            Arc::clone(&safety),
            Arc::clone(&table),
            events.clone(),
            config,
        );
        Rig {
            _worker: worker,
            ctl,
            layout,
            safety,
            table,
            calibrator,
            events,
        }
    }

    fn labels(trace: &[CalibrationPhase]) -> Vec<&'static str> {
        trace.iter().map(CalibrationPhase::label).collect()
    }

    #[test]
    fn soft_start_profile_is_monotonic_and_lands_on_target() {
        let profile = soft_start_profile(1000, 2000, 10);
        assert_eq!(profile.len(), 10);
        assert_eq!(*profile.last().unwrap(), 2000);
        assert!(profile.windows(2).all(|w| w[0] <= w[1]));
        // Gentle start: the first step is much smaller than the average.
        assert!(profile[0] - 1000 < 100);
    }

    #[test]
    fn backoff_moves_away_from_the_stop() {
        // Upper-limit seek stalled with the position frozen at 3000.
        assert_eq!(backed_off_limit(3000, 1, 100), 2900);
        assert_eq!(backed_off_limit(850, -1, 100), 950);
        assert_eq!(backed_off_limit(30, -1, 100), 130);
        assert_eq!(backed_off_limit(4150, 1, 0), SENSOR_MAX);
    }

    #[test]
    fn compute_record_insets_bounded_joints_only() {
        let bounded = JointDescriptor::new(1, "elbow_flex", JointKind::Bounded);
        let record = compute_record(&bounded, 3100, 900, 100).unwrap();
        assert_eq!(record.homing_offset, 2000 - SENSOR_CENTER);
        assert_eq!((record.range_min, record.range_max), (1000, 3000));

        let gripper = JointDescriptor::new(6, "gripper", JointKind::Gripper)
            .with_direction(Direction::Inverted);
        let record = compute_record(&gripper, 2000, 2201, 100).unwrap();
        assert_eq!((record.range_min, record.range_max), (2000, 2201));
        assert_eq!(record.homing_offset, 2100 - SENSOR_CENTER);
        assert_eq!(record.drive_mode, Direction::Inverted);
    }

    #[test]
    fn compute_record_rejects_narrow_ranges() {
        let bounded = JointDescriptor::new(1, "elbow_flex", JointKind::Bounded);
        let err = compute_record(&bounded, 1000, 1399, 100).unwrap_err();
        assert_eq!(
            err,
            CalibrationFailure::RangeTooNarrow {
                lower: 1000,
                upper: 1399,
                required: 400
            }
        );
    }

    #[test]
    fn bounded_joint_finds_both_stops() {
        let layout = ArmLayout::new(vec![JointDescriptor::new(1, "shoulder_pan", JointKind::Bounded)]);
        let rig = rig(
            SimBus::new().with_joint(SimJoint::bounded(1, 750, 3350)),
            layout,
            fast_config(),
        );
        let mut calibration_events = rig.events.subscribe_to(Topic::Calibration);

        let results = rig.calibrator.run_session(&rig.layout, &[JointId(1)]);
        let record = results[&JointId(1)].clone().unwrap();

        // Stops at 750 / 3350, backed off by two 50-unit steps, inset by 100.
        assert_eq!(record.range_min, 950);
        assert_eq!(record.range_max, 3150);
        assert_eq!(record.homing_offset, 2050 - SENSOR_CENTER);
        let center = record.expected_center(SENSOR_CENTER);
        assert!(record.range_min < center && center < record.range_max);
        assert!(record.range_max - record.range_min >= 2 * 100);

        assert_eq!(rig.table.get(JointId(1)), Some(record));
        assert_eq!(
            labels(&rig.calibrator.trace(JointId(1))),
            vec![
                "idle",
                "torque_armed",
                "seeking_lower_limit",
                "return_to_origin",
                "seeking_upper_limit",
                "computed",
                "committed"
            ]
        );

        // Parked at center, torque limit restored to full.
        let joint = rig.ctl.joint(JointId(1)).unwrap();
        assert_eq!(joint.position, 2050);
        assert_eq!(joint.torque_limit, 1000);
        assert!(
            calibration_events
                .drain()
                .iter()
                .any(|e| matches!(e.payload, EventPayload::CalibrationCommitted { .. }))
        );
    }

    #[test]
    fn calibration_uses_reduced_torque_limits() {
        let layout = ArmLayout::so101();
        let rig = rig(SimBus::so101(), layout, fast_config());
        rig.calibrator.run_session(&rig.layout, &[JointId(2), JointId(6)]);

        let limits: Vec<(JointId, i32)> = rig
            .ctl
            .writes()
            .into_iter()
            .filter(|(_, reg, _)| *reg == Register::TorqueLimit)
            .map(|(joint, _, value)| (joint, value))
            .collect();
        assert!(limits.contains(&(JointId(2), 300)));
        assert!(limits.contains(&(JointId(6), 200)));
    }

    #[test]
    fn continuous_joint_gets_full_scale_even_with_stops() {
        let layout = ArmLayout::new(vec![JointDescriptor::new(
            5,
            "wrist_roll",
            JointKind::ContinuousRotation,
        )]);
        // Give the simulated joint stops anyway: they must never be searched for.
        let rig = rig(
            SimBus::new().with_joint(SimJoint::bounded(5, 1900, 2300).with_position(2130)),
            layout,
            fast_config(),
        );

        let results = rig.calibrator.run_session(&rig.layout, &[JointId(5)]);
        let record = results[&JointId(5)].clone().unwrap();
        assert_eq!((record.range_min, record.range_max), (0, SENSOR_MAX));
        assert_eq!(record.homing_offset, 2130 - SENSOR_CENTER);
        assert!(
            !labels(&rig.calibrator.trace(JointId(5))).contains(&"seeking_lower_limit")
        );
    }

    #[test]
    fn gripper_keeps_its_full_range() {
        let layout = ArmLayout::new(vec![JointDescriptor::new(6, "gripper", JointKind::Gripper)]);
        let rig = rig(
            SimBus::new().with_joint(SimJoint::bounded(6, 1950, 3300).with_position(2100)),
            layout,
            fast_config(),
        );
        let record = rig.calibrator.run_session(&rig.layout, &[JointId(6)])[&JointId(6)]
            .clone()
            .unwrap();
        assert_eq!((record.range_min, record.range_max), (2050, 3200));
    }

    #[test]
    fn no_stop_within_budget_yields_provisional_limits() {
        let layout = ArmLayout::new(vec![JointDescriptor::new(1, "shoulder_pan", JointKind::Bounded)]);
        let config = CalibrationConfig {
            max_travel: 500,
            ..fast_config()
        };
        let rig = rig(SimBus::new().with_joint(SimJoint::free(1, 2000)), layout, config);

        let record = rig.calibrator.run_session(&rig.layout, &[JointId(1)])[&JointId(1)]
            .clone()
            .unwrap();
        assert_eq!(record.range_min, 1500 + 100);
        assert_eq!(record.range_max, 2500 - 100);
    }

    #[test]
    fn communication_loss_aborts_only_that_joint() {
        let layout = ArmLayout::so101();
        let rig = rig(SimBus::so101(), layout, fast_config());
        rig.ctl.set_reachable(JointId(3), false);

        let results = rig
            .calibrator
            .run_session(&rig.layout, &[JointId(1), JointId(3), JointId(4)]);
        assert!(results[&JointId(1)].is_ok());
        assert!(matches!(
            results[&JointId(3)],
            Err(ArmError::Calibration {
                reason: CalibrationFailure::Communication(_),
                ..
            })
        ));
        assert!(results[&JointId(4)].is_ok());
        assert!(rig.table.get(JointId(1)).is_some());
        assert!(rig.table.get(JointId(3)).is_none());
    }

    #[test]
    fn unknown_joint_is_reported_missing() {
        let rig = rig(SimBus::so101(), ArmLayout::so101(), fast_config());
        let results = rig.calibrator.run_session(&rig.layout, &[JointId(9)]);
        assert!(matches!(
            results[&JointId(9)],
            Err(ArmError::Calibration {
                reason: CalibrationFailure::JointMissing,
                ..
            })
        ));
    }

    #[test]
    fn emergency_stop_skips_remaining_joints() {
        let rig = rig(SimBus::so101(), ArmLayout::so101(), fast_config());
        rig.safety.emergency_stop("test");

        let results = rig.calibrator.run_session(&rig.layout, &[JointId(1), JointId(2)]);
        for joint in [JointId(1), JointId(2)] {
            assert!(matches!(
                results[&joint],
                Err(ArmError::Calibration {
                    reason: CalibrationFailure::EmergencyStop,
                    ..
                })
            ));
        }
        assert!(rig.table.is_empty());
    }

    #[test]
    fn overheated_joint_aborts_with_emergency_stop() {
        let layout = ArmLayout::new(vec![JointDescriptor::new(1, "shoulder_pan", JointKind::Bounded)]);
        let rig = rig(
            SimBus::new().with_joint(SimJoint::bounded(1, 750, 3350).with_temperature(55)),
            layout,
            fast_config(),
        );
        let descriptor = rig.layout.get(JointId(1)).unwrap().clone();

        let err = rig.calibrator.calibrate_joint(&descriptor).unwrap_err();
        assert_eq!(
            err,
            ArmError::Calibration {
                joint: JointId(1),
                reason: CalibrationFailure::EmergencyStop
            }
        );
        assert!(!rig.ctl.torque_enabled(JointId(1)));
        assert_eq!(
            rig.calibrator.trace(JointId(1)).last().map(CalibrationPhase::label),
            Some("aborted")
        );
    }

    #[test]
    fn thermal_pause_times_out() {
        let layout = ArmLayout::new(vec![JointDescriptor::new(1, "shoulder_pan", JointKind::Bounded)]);
        let rig = rig(
            SimBus::new().with_joint(SimJoint::bounded(1, 750, 3350).with_temperature(44)),
            layout,
            CalibrationConfig {
                max_pause_ms: 40,
                ..fast_config()
            },
        );
        // Warm joint: force the supervisor into Cooling first.
        let descriptor = rig.layout.get(JointId(1)).unwrap().clone();
        let t0 = Instant::now();
        let hot = armguard_types::TelemetrySample {
            joint: JointId(1),
            position: 2050,
            current_ma: 100,
            load: 0,
            temperature_c: 44.0,
            moving: false,
            timestamp: t0,
        };
        rig.safety.observe(&hot);
        rig.safety.observe(&armguard_types::TelemetrySample {
            timestamp: t0 + Duration::from_millis(1_100),
            ..hot
        });
        assert!(matches!(rig.safety.state(), armguard_types::SafetyState::Cooling { .. }));

        let err = rig.calibrator.calibrate_joint(&descriptor).unwrap_err();
        assert!(matches!(
            err,
            ArmError::Calibration {
                reason: CalibrationFailure::SafetyPauseTimeout { .. },
                ..
            }
        ));
    }

    fn torque_enables(ctl: &SimController) -> Vec<(JointId, Register, i32)> {
        ctl.writes()
            .into_iter()
            .filter(|&(_, register, value)| register == Register::TorqueEnable && value == 1)
            .collect()
    }

    #[test]
    fn session_never_energises_a_cooling_arm() {
        let layout = ArmLayout::new(vec![JointDescriptor::new(1, "shoulder_pan", JointKind::Bounded)]);
        let rig = rig(
            SimBus::new().with_joint(SimJoint::bounded(1, 750, 3350).with_temperature(44)),
            layout,
            CalibrationConfig {
                max_pause_ms: 30,
                ..fast_config()
            },
        );
        let t0 = Instant::now();
        let warm = armguard_types::TelemetrySample {
            joint: JointId(1),
            position: 2050,
            current_ma: 100,
            load: 0,
            temperature_c: 44.0,
            moving: false,
            timestamp: t0,
        };
        rig.safety.observe(&warm);
        rig.safety.observe(&armguard_types::TelemetrySample {
            timestamp: t0 + Duration::from_millis(1_100),
            ..warm
        });
        assert!(matches!(rig.safety.state(), armguard_types::SafetyState::Cooling { .. }));

        let results = rig.calibrator.run_session(&rig.layout, &[JointId(1)]);
        assert!(matches!(
            results.get(&JointId(1)),
            Some(Err(ArmError::Calibration {
                reason: CalibrationFailure::SafetyPauseTimeout { .. },
                ..
            }))
        ));
        assert!(torque_enables(&rig.ctl).is_empty());
        assert!(!rig.ctl.torque_enabled(JointId(1)));
    }

    #[test]
    fn stopped_arm_is_not_re_energised() {
        let layout = ArmLayout::new(vec![JointDescriptor::new(1, "shoulder_pan", JointKind::Bounded)]);
        let rig = rig(
            SimBus::new().with_joint(SimJoint::bounded(1, 750, 3350)),
            layout,
            fast_config(),
        );
        rig.safety.emergency_stop("test");
        let descriptor = rig.layout.get(JointId(1)).unwrap().clone();

        let err = rig.calibrator.calibrate_joint(&descriptor).unwrap_err();
        assert_eq!(
            err,
            ArmError::Calibration {
                joint: JointId(1),
                reason: CalibrationFailure::EmergencyStop
            }
        );
        assert!(torque_enables(&rig.ctl).is_empty());
    }
}
