//! In-process simulated arm for CI testing without physical hardware.
//!
//! [`SimBus`] implements [`BusTransport`] over a set of [`SimJoint`]s with a
//! crude but sufficient physical model:
//!
//! - a torque-enabled joint moves instantly to its goal, clamped by its
//!   mechanical stops;
//! - a joint pressing against a stop draws `stall_current_ma` and reports
//!   `stall_load`, otherwise `idle_current_ma` / `idle_load`;
//! - temperature is whatever the test sets it to.
//!
//! Tests reach into a running simulation through a [`SimController`], which
//! shares state with the bus even after the bus has moved into a
//! [`BusWorker`][crate::worker::BusWorker] thread. Scripted
//! [`SimReading`]s override the model sample by sample, and joints can be
//! made unreachable to inject timeouts.
//!
//! # Example
//!
//! ```rust
//! use armguard_hal::sim::{SimBus, SimJoint};
//! use armguard_hal::{BusTransport, Register};
//! use armguard_types::JointId;
//!
//! let mut bus = SimBus::new().with_joint(SimJoint::bounded(1, 1000, 3000));
//! bus.write(JointId(1), Register::TorqueEnable, 1).unwrap();
//! bus.write(JointId(1), Register::GoalPosition, 500).unwrap();
//! // Clamped by the lower stop.
//! assert_eq!(bus.read(JointId(1), Register::PresentPosition).unwrap(), 1000);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use armguard_types::{JointId, SENSOR_MAX};
use parking_lot::Mutex;

use crate::register::Register;
use crate::transport::{BusError, BusTransport};

/// Distance from the goal at which a blocked joint counts as pressing.
const PRESS_EPSILON: i32 = 5;

// ────────────────────────────────────────────────────────────────────────────
// Joints
// ────────────────────────────────────────────────────────────────────────────

/// One scripted poll: overrides every telemetry register for a single sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimReading {
    pub position: i32,
    pub current_ma: i32,
    pub load: i32,
    pub temperature_c: i32,
    pub moving: bool,
}

#[derive(Debug, Clone)]
pub struct SimJoint {
    pub id: JointId,
    pub position: i32,
    pub goal: i32,
    /// Mechanical stops; `None` for a joint that turns freely.
    pub stops: Option<(i32, i32)>,
    pub torque_enabled: bool,
    pub torque_limit: i32,
    pub temperature_c: i32,
    pub idle_current_ma: i32,
    pub stall_current_ma: i32,
    pub idle_load: i32,
    pub stall_load: i32,
    pub reachable: bool,
    script: VecDeque<SimReading>,
    frame: Option<SimReading>,
}

impl SimJoint {
    /// A joint with physical stops, resting midway between them.
    pub fn bounded(id: u8, lower: i32, upper: i32) -> Self {
        let mut joint = Self::free(id, (lower + upper) / 2);
        joint.stops = Some((lower, upper));
        joint
    }

    /// A joint without any stop, resting at `position`.
    pub fn free(id: u8, position: i32) -> Self {
        Self {
            id: JointId(id),
            position,
            goal: position,
            stops: None,
            torque_enabled: false,
            torque_limit: 1000,
            temperature_c: 28,
            idle_current_ma: 180,
            stall_current_ma: 700,
            idle_load: 40,
            stall_load: 850,
            reachable: true,
            script: VecDeque::new(),
            frame: None,
        }
    }

    pub fn with_position(mut self, position: i32) -> Self {
        self.position = position;
        self.goal = position;
        self
    }

    pub fn with_temperature(mut self, temperature_c: i32) -> Self {
        self.temperature_c = temperature_c;
        self
    }

    pub fn with_currents(mut self, idle_ma: i32, stall_ma: i32) -> Self {
        self.idle_current_ma = idle_ma;
        self.stall_current_ma = stall_ma;
        self
    }

    fn pressing(&self) -> bool {
        self.torque_enabled && (self.goal - self.position).abs() > PRESS_EPSILON
    }

    fn modelled(&self) -> SimReading {
        let pressing = self.pressing();
        SimReading {
            position: self.position,
            current_ma: match (self.torque_enabled, pressing) {
                (false, _) => 0,
                (true, true) => self.stall_current_ma,
                (true, false) => self.idle_current_ma,
            },
            load: if pressing { self.stall_load } else { self.idle_load },
            temperature_c: self.temperature_c,
            moving: false,
        }
    }

    fn move_towards_goal(&mut self) {
        if !self.torque_enabled {
            return;
        }
        self.position = match self.stops {
            Some((lower, upper)) => self.goal.clamp(lower, upper),
            None => self.goal,
        };
    }

    fn read(&mut self, register: Register) -> i32 {
        if register == Register::PresentPosition {
            self.frame = self.script.pop_front();
        }
        let reading = self.frame.unwrap_or_else(|| self.modelled());
        match register {
            Register::TorqueEnable => i32::from(self.torque_enabled),
            Register::GoalPosition => self.goal,
            Register::TorqueLimit => self.torque_limit,
            Register::PresentPosition => reading.position,
            Register::PresentLoad => reading.load,
            Register::PresentTemperature => reading.temperature_c,
            Register::Moving => i32::from(reading.moving),
            Register::PresentCurrent => reading.current_ma,
        }
    }

    fn write(&mut self, register: Register, value: i32) {
        match register {
            Register::TorqueEnable => {
                let enable = value != 0;
                if enable && !self.torque_enabled {
                    // Holding torque keeps the joint where it is.
                    self.goal = self.position;
                }
                self.torque_enabled = enable;
            }
            Register::GoalPosition => {
                self.goal = value.clamp(0, SENSOR_MAX);
                self.move_towards_goal();
            }
            Register::TorqueLimit => self.torque_limit = value.clamp(0, 1000),
            _ => {}
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimState {
    joints: BTreeMap<JointId, SimJoint>,
    writes: Vec<(JointId, Register, i32)>,
}

/// Test-side view of a running simulation.
#[derive(Clone)]
pub struct SimController {
    state: Arc<Mutex<SimState>>,
}

impl SimController {
    pub fn joint(&self, joint: JointId) -> Option<SimJoint> {
        self.state.lock().joints.get(&joint).cloned()
    }

    pub fn torque_enabled(&self, joint: JointId) -> bool {
        self.joint(joint).is_some_and(|j| j.torque_enabled)
    }

    pub fn set_temperature(&self, joint: JointId, temperature_c: i32) {
        self.with_joint(joint, |j| j.temperature_c = temperature_c);
    }

    pub fn set_reachable(&self, joint: JointId, reachable: bool) {
        self.with_joint(joint, |j| j.reachable = reachable);
    }

    /// Move a joint by hand, as if an operator pushed it.
    pub fn set_position(&self, joint: JointId, position: i32) {
        self.with_joint(joint, |j| {
            j.position = position;
            j.goal = position;
        });
    }

    pub fn set_idle_current(&self, joint: JointId, current_ma: i32) {
        self.with_joint(joint, |j| j.idle_current_ma = current_ma);
    }

    /// Queue readings that replace the model for the next samples.
    pub fn push_script(&self, joint: JointId, readings: impl IntoIterator<Item = SimReading>) {
        self.with_joint(joint, |j| j.script.extend(readings));
    }

    /// Every write the bus has accepted, oldest first.
    pub fn writes(&self) -> Vec<(JointId, Register, i32)> {
        self.state.lock().writes.clone()
    }

    fn with_joint(&self, joint: JointId, f: impl FnOnce(&mut SimJoint)) {
        if let Some(j) = self.state.lock().joints.get_mut(&joint) {
            f(j);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimBus
// ────────────────────────────────────────────────────────────────────────────

/// A simulated arm bus. Always answers unless a joint is unreachable.
#[derive(Default)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_joint(self, joint: SimJoint) -> Self {
        self.state.lock().joints.insert(joint.id, joint);
        self
    }

    /// Six joints matching [`ArmLayout::so101`][armguard_types::ArmLayout::so101].
    pub fn so101() -> Self {
        Self::new()
            .with_joint(SimJoint::bounded(1, 750, 3350))
            .with_joint(SimJoint::bounded(2, 900, 3200))
            .with_joint(SimJoint::bounded(3, 850, 3050))
            .with_joint(SimJoint::bounded(4, 1000, 3100))
            .with_joint(SimJoint::free(5, 2130))
            .with_joint(SimJoint::bounded(6, 1950, 3300).with_position(2100))
    }

    pub fn controller(&self) -> SimController {
        SimController {
            state: Arc::clone(&self.state),
        }
    }
}

impl BusTransport for SimBus {
    fn read(&mut self, joint: JointId, register: Register) -> Result<i32, BusError> {
        let mut state = self.state.lock();
        match state.joints.get_mut(&joint) {
            Some(j) if j.reachable => Ok(j.read(register)),
            _ => Err(BusError::Timeout { joint, register }),
        }
    }

    fn write(&mut self, joint: JointId, register: Register, value: i32) -> Result<(), BusError> {
        let mut state = self.state.lock();
        match state.joints.get_mut(&joint) {
            Some(j) if j.reachable => j.write(register, value),
            _ => return Err(BusError::Timeout { joint, register }),
        }
        state.writes.push((joint, register, value));
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<JointId>, BusError> {
        Ok(self
            .state
            .lock()
            .joints
            .values()
            .filter(|j| j.reachable)
            .map(|j| j.id)
            .collect())
    }
}
