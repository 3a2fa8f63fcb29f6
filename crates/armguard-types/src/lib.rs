//! `armguard-types` – shared vocabulary of the calibration and safety layer.
//!
//! Every other crate in the workspace speaks in these types: joint
//! descriptors, telemetry samples, calibration records, the arm-wide
//! [`SafetyState`], event-bus payloads and the global [`ArmError`].

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of distinct readings of the 12-bit position sensor.
pub const SENSOR_RESOLUTION: i32 = 4096;
/// Highest raw position the sensor can report.
pub const SENSOR_MAX: i32 = SENSOR_RESOLUTION - 1;
/// Nominal mid-scale reading; a homing offset of zero maps this to logical zero.
pub const SENSOR_CENTER: i32 = SENSOR_RESOLUTION / 2;

// ────────────────────────────────────────────────────────────────────────────
// Joints
// ────────────────────────────────────────────────────────────────────────────

/// Bus identifier of one actuated joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointId(pub u8);

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mechanical kind of a joint; decides how the calibrator treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointKind {
    /// Travel is bounded by two physical stops.
    Bounded,
    /// No physical stop exists (e.g. a wrist roll).
    ContinuousRotation,
    /// End effector that must reach fully open and fully closed.
    Gripper,
}

/// Direction flag written to the actuator's drive-mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Normal,
    Inverted,
}

impl Direction {
    /// Raw drive-mode value (`0` = normal, `1` = inverted).
    pub fn drive_mode(self) -> u8 {
        match self {
            Direction::Normal => 0,
            Direction::Inverted => 1,
        }
    }

    /// Inverse of [`Direction::drive_mode`]. Any non-zero value is inverted.
    pub fn from_drive_mode(value: u8) -> Self {
        if value == 0 {
            Direction::Normal
        } else {
            Direction::Inverted
        }
    }

    pub fn sign(self) -> i32 {
        match self {
            Direction::Normal => 1,
            Direction::Inverted => -1,
        }
    }
}

/// Immutable description of a joint, fixed at arm configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointDescriptor {
    pub id: JointId,
    /// Human-readable name, e.g. `"shoulder_pan"`.
    pub name: String,
    pub kind: JointKind,
    /// Nominal center of the position sensor for this joint.
    pub center: i32,
    pub direction: Direction,
}

impl JointDescriptor {
    /// A descriptor centred on [`SENSOR_CENTER`] with [`Direction::Normal`].
    pub fn new(id: u8, name: impl Into<String>, kind: JointKind) -> Self {
        Self {
            id: JointId(id),
            name: name.into(),
            kind,
            center: SENSOR_CENTER,
            direction: Direction::Normal,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_center(mut self, center: i32) -> Self {
        self.center = center;
        self
    }
}

/// The set of joints sharing one arm bus.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArmLayout {
    pub joints: Vec<JointDescriptor>,
}

impl ArmLayout {
    pub fn new(joints: Vec<JointDescriptor>) -> Self {
        Self { joints }
    }

    /// The six-joint SO-101 arm: five revolute joints and a gripper.
    pub fn so101() -> Self {
        Self::new(vec![
            JointDescriptor::new(1, "shoulder_pan", JointKind::Bounded),
            JointDescriptor::new(2, "shoulder_lift", JointKind::Bounded),
            JointDescriptor::new(3, "elbow_flex", JointKind::Bounded),
            JointDescriptor::new(4, "wrist_flex", JointKind::Bounded),
            JointDescriptor::new(5, "wrist_roll", JointKind::ContinuousRotation),
            JointDescriptor::new(6, "gripper", JointKind::Gripper),
        ])
    }

    pub fn get(&self, id: JointId) -> Option<&JointDescriptor> {
        self.joints.iter().find(|j| j.id == id)
    }

    pub fn ids(&self) -> Vec<JointId> {
        self.joints.iter().map(|j| j.id).collect()
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry & calibration
// ────────────────────────────────────────────────────────────────────────────

/// One poll of one joint's sensor channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub joint: JointId,
    /// Raw position in sensor units (`0..=SENSOR_MAX`).
    pub position: i32,
    pub current_ma: u32,
    /// Normalized torque indicator, `0..=1000`.
    pub load: u16,
    pub temperature_c: f32,
    pub moving: bool,
    pub timestamp: Instant,
}

/// Result of a successful calibration of one joint.
///
/// These four fields are the only per-joint state that is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub homing_offset: i32,
    pub range_min: i32,
    pub range_max: i32,
    pub drive_mode: Direction,
}

impl CalibrationRecord {
    /// Raw sensor reading that the homing offset maps to logical zero, for a
    /// joint whose nominal center is `nominal_center`.
    pub fn expected_center(&self, nominal_center: i32) -> i32 {
        nominal_center + self.homing_offset
    }

    pub fn contains(&self, position: i32) -> bool {
        (self.range_min..=self.range_max).contains(&position)
    }

    pub fn span(&self) -> i32 {
        self.range_max - self.range_min
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Safety
// ────────────────────────────────────────────────────────────────────────────

/// Why the supervisor raised a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningReason {
    Temperature,
    /// Position within the configured margin of a calibrated limit.
    NearRangeLimit,
}

/// Arm-wide safety state. Only the safety supervisor transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyState {
    Nominal,
    Warning { joint: JointId, reason: WarningReason },
    /// Motion is blocked until `joint` cools down or `until` passes.
    Cooling { joint: JointId, until: Instant },
    /// Terminal until an explicit external reset.
    EmergencyStopped,
}

impl SafetyState {
    /// Motion may only be commanded in `Nominal` or `Warning`.
    pub fn allows_motion(&self) -> bool {
        matches!(self, SafetyState::Nominal | SafetyState::Warning { .. })
    }

    pub fn is_emergency_stopped(&self) -> bool {
        matches!(self, SafetyState::EmergencyStopped)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SafetyState::Nominal => "nominal",
            SafetyState::Warning { .. } => "warning",
            SafetyState::Cooling { .. } => "cooling",
            SafetyState::EmergencyStopped => "emergency_stopped",
        }
    }

    /// The joint the state refers to, if any.
    pub fn joint(&self) -> Option<JointId> {
        match self {
            SafetyState::Warning { joint, .. } | SafetyState::Cooling { joint, .. } => Some(*joint),
            _ => None,
        }
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.joint() {
            Some(joint) => write!(f, "{}(joint {joint})", self.label()),
            None => f.write_str(self.label()),
        }
    }
}

/// Advisory per-joint health in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthScore(u8);

impl HealthScore {
    pub const MAX: HealthScore = HealthScore(100);

    /// Clamp an arbitrary score into `[0, 100]`.
    pub fn new(score: i32) -> Self {
        HealthScore(score.clamp(0, 100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for HealthScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// Envelope for everything routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"armguard-kernel::safety"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    SafetyTransition {
        from: String,
        to: String,
        joint: Option<JointId>,
    },
    EmergencyStop {
        disabled: Vec<JointId>,
        unreachable: Vec<JointId>,
    },
    StallConfirmed {
        joint: JointId,
        position: i32,
    },
    CalibrationCommitted {
        joint: JointId,
        record: CalibrationRecord,
    },
    CalibrationFailed {
        joint: JointId,
        reason: CalibrationFailure,
    },
    DriftDetected {
        joint: JointId,
        position_spread: i32,
        temperature_rise: f32,
        center_discrepancy: i32,
    },
    HomingCompensated {
        joint: JointId,
        old_offset: i32,
        new_offset: i32,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Why one joint's calibration run was aborted.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationFailure {
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("arm is emergency-stopped")]
    EmergencyStop,
    #[error("safety pause exceeded {waited_ms} ms")]
    SafetyPauseTimeout { waited_ms: u64 },
    #[error("discovered range [{lower}, {upper}] is narrower than {required} units")]
    RangeTooNarrow { lower: i32, upper: i32, required: i32 },
    #[error("joint is not part of the arm layout")]
    JointMissing,
    #[error("could not persist calibration: {0}")]
    Storage(String),
}

/// Global error type for the calibration and safety layer.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArmError {
    #[error("Communication error on joint {joint}: {details}")]
    Communication { joint: JointId, details: String },

    #[error("Calibration of joint {joint} failed: {reason}")]
    Calibration {
        joint: JointId,
        reason: CalibrationFailure,
    },

    #[error("Arm is emergency-stopped")]
    EmergencyStopped,

    #[error("Unknown joint {0}")]
    UnknownJoint(JointId),

    #[error("Emergency-stop reset refused: {0}")]
    ResetRefused(String),

    #[error("Calibration storage error: {0}")]
    Storage(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ArmError {
    /// Map any error raised while calibrating `joint` onto a typed failure.
    pub fn into_calibration(self, joint: JointId) -> ArmError {
        let reason = match self {
            ArmError::Calibration { reason, .. } => reason,
            ArmError::EmergencyStopped => CalibrationFailure::EmergencyStop,
            ArmError::UnknownJoint(_) => CalibrationFailure::JointMissing,
            ArmError::Storage(details) => CalibrationFailure::Storage(details),
            other => CalibrationFailure::Communication(other.to_string()),
        };
        ArmError::Calibration { joint, reason }
    }
}
