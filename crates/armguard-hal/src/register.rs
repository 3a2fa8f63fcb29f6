//! Control-table registers used by the calibration and safety layer.
//!
//! Addresses follow the Feetech STS/SMS memory map. The wire encoding of a
//! register (byte width, sign bit, endianness) is the transport's business;
//! at this layer every value is an `i32` in engineering units.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register {
    /// `1` = torque on, `0` = free-wheeling.
    TorqueEnable,
    GoalPosition,
    /// Torque cap in tenths of a percent (`0..=1000`).
    TorqueLimit,
    PresentPosition,
    /// Load magnitude, `0..=1000`.
    PresentLoad,
    /// Degrees Celsius.
    PresentTemperature,
    /// `1` while the actuator is still travelling to its goal.
    Moving,
    /// Milliamps.
    PresentCurrent,
}

impl Register {
    pub const ALL: [Register; 8] = [
        Register::TorqueEnable,
        Register::GoalPosition,
        Register::TorqueLimit,
        Register::PresentPosition,
        Register::PresentLoad,
        Register::PresentTemperature,
        Register::Moving,
        Register::PresentCurrent,
    ];

    /// Address in the actuator's control table.
    pub fn address(self) -> u8 {
        match self {
            Register::TorqueEnable => 0x28,
            Register::GoalPosition => 0x2A,
            Register::TorqueLimit => 0x30,
            Register::PresentPosition => 0x38,
            Register::PresentLoad => 0x3C,
            Register::PresentTemperature => 0x3F,
            Register::Moving => 0x42,
            Register::PresentCurrent => 0x45,
        }
    }

    /// Only the RAM-area command registers accept writes.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Register::TorqueEnable | Register::GoalPosition | Register::TorqueLimit
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::TorqueEnable => "Torque_Enable",
            Register::GoalPosition => "Goal_Position",
            Register::TorqueLimit => "Torque_Limit",
            Register::PresentPosition => "Present_Position",
            Register::PresentLoad => "Present_Load",
            Register::PresentTemperature => "Present_Temperature",
            Register::Moving => "Moving",
            Register::PresentCurrent => "Present_Current",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
