//! [`StallDetector`] – is a joint pushing against a mechanical limit?
//!
//! A joint is considered stalled when **both** hold:
//!
//! 1. its current exceeds `current_ratio ×` its baseline holding current, and
//! 2. either the load exceeds `load_threshold`, or the position has not moved
//!    by more than `position_epsilon` over the last `stagnation_samples`
//!    samples while the goal is still more than `position_epsilon` away.
//!
//! Current alone is not enough: joints draw short spikes while accelerating.
//! A single qualifying evaluation is only a suspicion; [`StallDetector::observe`]
//! confirms a stall after `confirmations` consecutive qualifying evaluations.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use armguard_hal::{BusHandle, Register, TelemetryMonitor};
use armguard_middleware::EventBus;
use armguard_types::{ArmError, EventPayload, JointId, TelemetrySample};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

const SOURCE: &str = "armguard-kernel::stall";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    pub current_ratio: f64,
    pub load_threshold: u16,
    pub position_epsilon: i32,
    pub stagnation_samples: usize,
    /// Consecutive qualifying evaluations required to confirm a stall.
    pub confirmations: u32,
    pub baseline_reads: u32,
    pub baseline_settle_ms: u64,
    pub baseline_read_interval_ms: u64,
    /// Floor applied to implausibly low baselines, and used when none exists.
    pub min_baseline_ma: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            current_ratio: 2.5,
            load_threshold: 800,
            position_epsilon: 5,
            stagnation_samples: 3,
            confirmations: 2,
            baseline_reads: 5,
            baseline_settle_ms: 300,
            baseline_read_interval_ms: 20,
            min_baseline_ma: 100,
        }
    }
}

impl StallConfig {
    pub fn baseline_settle(&self) -> Duration {
        Duration::from_millis(self.baseline_settle_ms)
    }
}

/// Which half of the second condition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StallTrigger {
    None,
    Load,
    Stagnation,
    LoadAndStagnation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StallDiagnostics {
    pub current_ma: u32,
    pub baseline_ma: u32,
    pub load: u16,
    pub position: i32,
    pub goal: i32,
    pub moving: bool,
    pub current_exceeded: bool,
    pub trigger: StallTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StallVerdict {
    Clear(StallDiagnostics),
    /// Qualified `streak` times in a row, not yet confirmed.
    Suspected {
        streak: u32,
        diagnostics: StallDiagnostics,
    },
    /// `stall_position` is the position at the first qualifying evaluation.
    Confirmed {
        stall_position: i32,
        diagnostics: StallDiagnostics,
    },
}

impl StallVerdict {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, StallVerdict::Confirmed { .. })
    }
}

/// Evaluate the stall condition over `window` (oldest first, newest last).
///
/// Returns `None` for an empty window.
pub fn evaluate(
    config: &StallConfig,
    baseline_ma: u32,
    window: &[TelemetrySample],
    goal: i32,
) -> Option<(bool, StallDiagnostics)> {
    let latest = window.last()?;

    let current_exceeded = f64::from(latest.current_ma) > config.current_ratio * f64::from(baseline_ma);
    let loaded = latest.load > config.load_threshold;

    let tail = &window[window.len().saturating_sub(config.stagnation_samples)..];
    let stagnant = tail.len() >= config.stagnation_samples.max(1) && {
        let min = tail.iter().map(|s| s.position).min().unwrap_or(latest.position);
        let max = tail.iter().map(|s| s.position).max().unwrap_or(latest.position);
        max - min <= config.position_epsilon
            && (goal - latest.position).abs() > config.position_epsilon
    };

    let trigger = match (loaded, stagnant) {
        (true, true) => StallTrigger::LoadAndStagnation,
        (true, false) => StallTrigger::Load,
        (false, true) => StallTrigger::Stagnation,
        (false, false) => StallTrigger::None,
    };
    let stalled = current_exceeded && trigger != StallTrigger::None;

    Some((
        stalled,
        StallDiagnostics {
            current_ma: latest.current_ma,
            baseline_ma,
            load: latest.load,
            position: latest.position,
            goal,
            moving: latest.moving,
            current_exceeded,
            trigger,
        },
    ))
}

#[derive(Debug, Clone, Copy)]
struct Streak {
    count: u32,
    first_position: i32,
}

// ────────────────────────────────────────────────────────────────────────────
// StallDetector
// ────────────────────────────────────────────────────────────────────────────

pub struct StallDetector {
    bus: BusHandle,
    telemetry: Arc<TelemetryMonitor>,
    events: EventBus,
    config: StallConfig,
    baselines: RwLock<HashMap<JointId, u32>>,
    streaks: Mutex<HashMap<JointId, Streak>>,
}

impl StallDetector {
    pub fn new(
        bus: BusHandle,
        telemetry: Arc<TelemetryMonitor>,
        events: EventBus,
        config: StallConfig,
    ) -> Self {
        Self {
            bus,
            telemetry,
            events,
            config,
            baselines: RwLock::new(HashMap::new()),
            streaks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StallConfig {
        &self.config
    }

    /// Capture the holding current of each joint.
    ///
    /// Torque is enabled with the goal pinned to the present position, the
    /// joint settles, and `baseline_reads` current reads are averaged. The
    /// previous torque-enable state is restored afterwards.
    ///
    /// # Errors
    ///
    /// [`ArmError::Communication`] as soon as any joint fails to answer.
    pub fn calibrate_baseline(&self, joints: &[JointId]) -> Result<(), ArmError> {
        self.calibrate_baseline_gated(joints, |_| Ok(()))
    }

    /// [`StallDetector::calibrate_baseline`], asking `gate` right before
    /// torque is enabled on each joint. A gate error aborts with nothing
    /// written to that joint's torque-enable register.
    #[instrument(skip(self, gate))]
    pub fn calibrate_baseline_gated<G>(&self, joints: &[JointId], gate: G) -> Result<(), ArmError>
    where
        G: Fn(JointId) -> Result<(), ArmError>,
    {
        for &joint in joints {
            let baseline = self.measure_baseline(joint, &gate)?;
            info!(joint = %joint, baseline_ma = baseline, "baseline current captured");
            self.baselines.write().insert(joint, baseline);
        }
        Ok(())
    }

    fn measure_baseline<G>(&self, joint: JointId, gate: &G) -> Result<u32, ArmError>
    where
        G: Fn(JointId) -> Result<(), ArmError>,
    {
        let torque_was = self.bus.read(joint, Register::TorqueEnable)?;
        let position = self.bus.read(joint, Register::PresentPosition)?;
        self.bus.write(joint, Register::GoalPosition, position)?;
        gate(joint)?;
        self.bus.write(joint, Register::TorqueEnable, 1)?;
        thread::sleep(self.config.baseline_settle());

        let reads = self.config.baseline_reads.max(1);
        let mut total: u64 = 0;
        for i in 0..reads {
            if i > 0 {
                thread::sleep(Duration::from_millis(self.config.baseline_read_interval_ms));
            }
            total += u64::from(self.bus.read(joint, Register::PresentCurrent)?.unsigned_abs());
        }
        let average = u32::try_from(total / u64::from(reads)).unwrap_or(u32::MAX);

        if torque_was == 0 {
            self.bus.write(joint, Register::TorqueEnable, 0)?;
        }
        if average < self.config.min_baseline_ma {
            debug!(joint = %joint, measured_ma = average, "baseline implausibly low; using floor");
        }
        Ok(average.max(self.config.min_baseline_ma))
    }

    pub fn baseline(&self, joint: JointId) -> Option<u32> {
        self.baselines.read().get(&joint).copied()
    }

    pub fn set_baseline(&self, joint: JointId, baseline_ma: u32) {
        self.baselines.write().insert(joint, baseline_ma);
    }

    fn effective_baseline(&self, joint: JointId) -> u32 {
        self.baseline(joint).unwrap_or(self.config.min_baseline_ma)
    }

    /// Take a fresh sample and evaluate the stall condition for `joint`.
    ///
    /// Diagnostics are returned whether or not the joint is stalled.
    pub fn is_stalled(&self, joint: JointId) -> Result<(bool, StallDiagnostics), ArmError> {
        let sample = self.telemetry.sample(joint)?;
        let goal = self.bus.read(joint, Register::GoalPosition)?;
        let mut window = self
            .telemetry
            .recent(joint, self.config.stagnation_samples.max(1));
        if window.last().map(|s| s.timestamp) != Some(sample.timestamp) {
            window.push(sample);
        }

        let baseline = self.effective_baseline(joint);
        let (stalled, diagnostics) =
            evaluate(&self.config, baseline, &window, goal).ok_or(ArmError::UnknownJoint(joint))?;
        debug!(
            joint = %joint,
            stalled,
            current_ma = diagnostics.current_ma,
            baseline_ma = baseline,
            load = diagnostics.load,
            position = diagnostics.position,
            goal,
            trigger = ?diagnostics.trigger,
            "stall evaluation"
        );
        Ok((stalled, diagnostics))
    }

    /// Evaluate once and fold the result into the joint's confirmation streak.
    pub fn observe(&self, joint: JointId) -> Result<StallVerdict, ArmError> {
        let (stalled, diagnostics) = self.is_stalled(joint)?;
        Ok(self.fold(joint, stalled, diagnostics))
    }

    fn fold(&self, joint: JointId, stalled: bool, diagnostics: StallDiagnostics) -> StallVerdict {
        let mut streaks = self.streaks.lock();
        if !stalled {
            streaks.remove(&joint);
            return StallVerdict::Clear(diagnostics);
        }

        let streak = streaks.entry(joint).or_insert(Streak {
            count: 0,
            first_position: diagnostics.position,
        });
        streak.count += 1;
        if streak.count < self.config.confirmations.max(1) {
            return StallVerdict::Suspected {
                streak: streak.count,
                diagnostics,
            };
        }

        let stall_position = streak.first_position;
        streaks.remove(&joint);
        drop(streaks);

        info!(joint = %joint, stall_position, "stall confirmed");
        self.events.emit(
            SOURCE,
            EventPayload::StallConfirmed {
                joint,
                position: stall_position,
            },
        );
        StallVerdict::Confirmed {
            stall_position,
            diagnostics,
        }
    }

    /// Forget any partial streak for `joint`.
    pub fn reset(&self, joint: JointId) {
        self.streaks.lock().remove(&joint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armguard_hal::{BusConfig, BusWorker, SimBus, SimJoint, SimReading, TelemetryConfig};
    use armguard_middleware::Topic;
    use std::time::Instant;

    struct Rig {
        _worker: BusWorker,
        bus: BusHandle,
        ctl: armguard_hal::SimController,
        detector: StallDetector,
        events: EventBus,
    }

    fn rig(sim: SimBus) -> Rig {
        let ctl = sim.controller();
        let worker = BusWorker::spawn(sim, BusConfig::default()).unwrap();
        let bus = worker.handle();
        let telemetry = Arc::new(TelemetryMonitor::new(
            bus.clone(),
            vec![JointId(1)],
            TelemetryConfig::default(),
        ));
        let events = EventBus::default();
        let config = StallConfig {
            baseline_settle_ms: 1,
            baseline_read_interval_ms: 0,
            ..StallConfig::default()
        };
        let detector = StallDetector::new(bus.clone(), telemetry, events.clone(), config);
        Rig {
            _worker: worker,
            bus,
            ctl,
            detector,
            events,
        }
    }

    fn reading(position: i32, current_ma: i32, load: i32) -> SimReading {
        SimReading {
            position,
            current_ma,
            load,
            temperature_c: 30,
            moving: false,
        }
    }

    fn sample(position: i32, current_ma: u32, load: u16) -> TelemetrySample {
        TelemetrySample {
            joint: JointId(1),
            position,
            current_ma,
            load,
            temperature_c: 30.0,
            moving: false,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn current_alone_is_not_a_stall() {
        let config = StallConfig::default();
        let window = [sample(1000, 0, 0), sample(1100, 0, 0), sample(1200, 900, 100)];
        let (stalled, diag) = evaluate(&config, 200, &window, 1250).unwrap();
        assert!(!stalled);
        assert!(diag.current_exceeded);
        assert_eq!(diag.trigger, StallTrigger::None);
    }

    #[test]
    fn stagnation_requires_a_distant_goal() {
        let config = StallConfig::default();
        let window = [sample(1500, 600, 100), sample(1502, 600, 100), sample(1501, 600, 100)];

        let (stalled, diag) = evaluate(&config, 200, &window, 1600).unwrap();
        assert!(stalled);
        assert_eq!(diag.trigger, StallTrigger::Stagnation);

        // Goal reached: a still joint is just holding.
        let (stalled, _) = evaluate(&config, 200, &window, 1503).unwrap();
        assert!(!stalled);
    }

    #[test]
    fn short_window_cannot_be_stagnant() {
        let config = StallConfig::default();
        let window = [sample(1500, 600, 100)];
        let (stalled, _) = evaluate(&config, 200, &window, 2000).unwrap();
        assert!(!stalled);
        assert!(evaluate(&config, 200, &[], 2000).is_none());
    }

    #[test]
    fn baseline_is_averaged_floored_and_torque_restored() {
        let rig = rig(SimBus::new().with_joint(SimJoint::bounded(1, 1000, 3000)));
        rig.detector.calibrate_baseline(&[JointId(1)]).unwrap();
        assert_eq!(rig.detector.baseline(JointId(1)), Some(180));
        assert!(!rig.ctl.torque_enabled(JointId(1)));

        rig.ctl.set_idle_current(JointId(1), 40);
        rig.detector.calibrate_baseline(&[JointId(1)]).unwrap();
        assert_eq!(rig.detector.baseline(JointId(1)), Some(100));
    }

    #[test]
    fn baseline_fails_for_unreachable_joint() {
        let rig = rig(SimBus::new().with_joint(SimJoint::bounded(1, 1000, 3000)));
        rig.ctl.set_reachable(JointId(1), false);
        let err = rig.detector.calibrate_baseline(&[JointId(1)]).unwrap_err();
        assert!(matches!(err, ArmError::Communication { .. }));
    }

    #[test]
    fn refused_gate_never_enables_torque() {
        let rig = rig(SimBus::new().with_joint(SimJoint::bounded(1, 1000, 3000)));
        let err = rig
            .detector
            .calibrate_baseline_gated(&[JointId(1)], |_| Err(ArmError::EmergencyStopped))
            .unwrap_err();
        assert_eq!(err, ArmError::EmergencyStopped);
        assert!(!rig.ctl.torque_enabled(JointId(1)));
        assert!(
            !rig.ctl
                .writes()
                .iter()
                .any(|&(_, register, value)| register == Register::TorqueEnable && value == 1)
        );
        assert_eq!(rig.detector.baseline(JointId(1)), None);
    }

    #[test]
    fn stall_confirmed_on_second_consecutive_qualifying_sample() {
        let rig = rig(SimBus::new().with_joint(SimJoint::free(1, 2900)));
        let joint = JointId(1);
        rig.detector.set_baseline(joint, 200);
        rig.bus.write(joint, Register::TorqueEnable, 1).unwrap();
        rig.bus.write(joint, Register::GoalPosition, 3500).unwrap();
        rig.ctl.push_script(
            joint,
            [
                reading(2900, 210, 50),
                reading(2950, 220, 60),
                reading(3000, 650, 850),
                reading(3000, 900, 900),
                reading(3000, 900, 900),
            ],
        );
        let mut safety = rig.events.subscribe_to(Topic::Safety);

        assert!(matches!(rig.detector.observe(joint).unwrap(), StallVerdict::Clear(_)));
        assert!(matches!(rig.detector.observe(joint).unwrap(), StallVerdict::Clear(_)));
        assert!(matches!(
            rig.detector.observe(joint).unwrap(),
            StallVerdict::Suspected { streak: 1, .. }
        ));
        match rig.detector.observe(joint).unwrap() {
            StallVerdict::Confirmed { stall_position, .. } => assert_eq!(stall_position, 3000),
            other => panic!("expected confirmation at sample 4, got {other:?}"),
        }
        assert_eq!(safety.drain().len(), 1);
    }

    #[test]
    fn single_current_spike_never_confirms() {
        let rig = rig(SimBus::new().with_joint(SimJoint::free(1, 2000)));
        let joint = JointId(1);
        rig.detector.set_baseline(joint, 200);
        rig.bus.write(joint, Register::TorqueEnable, 1).unwrap();
        rig.bus.write(joint, Register::GoalPosition, 2600).unwrap();
        rig.ctl.push_script(
            joint,
            [
                reading(2000, 200, 100),
                reading(2050, 600, 900),
                reading(2100, 200, 100),
                reading(2150, 200, 100),
            ],
        );

        for _ in 0..4 {
            assert!(!rig.detector.observe(joint).unwrap().is_confirmed());
        }
    }

    #[test]
    fn missing_baseline_falls_back_to_floor() {
        let rig = rig(SimBus::new().with_joint(SimJoint::free(1, 2000)));
        let joint = JointId(1);
        rig.ctl.push_script(joint, [reading(2000, 260, 900)]);
        let (stalled, diag) = rig.detector.is_stalled(joint).unwrap();
        assert_eq!(diag.baseline_ma, 100);
        assert!(stalled);
    }
}
