//! The [`BusTransport`] trait – what a concrete bus driver must provide.
//!
//! A transport is a reliable request/response channel with its own per-call
//! timeout. It is owned by exactly one [`BusWorker`][crate::worker::BusWorker]
//! thread, so implementations never need internal locking.

use armguard_types::{ArmError, JointId};
use thiserror::Error;

use crate::register::Register;

/// Errors raised at the bus boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("joint {joint} did not answer {register} in time")]
    Timeout { joint: JointId, register: Register },

    #[error("malformed response from joint {joint} for {register}: {details}")]
    Malformed {
        joint: JointId,
        register: Register,
        details: String,
    },

    #[error("register {register} is read-only")]
    ReadOnly { joint: JointId, register: Register },

    #[error("bus scan failed: {0}")]
    Scan(String),

    #[error("bus worker is not running")]
    WorkerGone,
}

impl BusError {
    /// Transient failures are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Timeout { .. } | BusError::Malformed { .. })
    }

    pub fn joint(&self) -> Option<JointId> {
        match self {
            BusError::Timeout { joint, .. }
            | BusError::Malformed { joint, .. }
            | BusError::ReadOnly { joint, .. } => Some(*joint),
            BusError::Scan(_) | BusError::WorkerGone => None,
        }
    }
}

impl From<BusError> for ArmError {
    fn from(err: BusError) -> Self {
        match err.joint() {
            Some(joint) => ArmError::Communication {
                joint,
                details: err.to_string(),
            },
            None => ArmError::Channel(err.to_string()),
        }
    }
}

/// Request/response primitives of the arm's serial bus.
///
/// Writes are assumed idempotent, and a non-responding joint is detected
/// purely through [`BusError::Timeout`].
pub trait BusTransport: Send + 'static {
    fn read(&mut self, joint: JointId, register: Register) -> Result<i32, BusError>;

    fn write(&mut self, joint: JointId, register: Register, value: i32) -> Result<(), BusError>;

    /// Ids of every joint that answers a ping, in ascending order.
    fn scan(&mut self) -> Result<Vec<JointId>, BusError>;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn read(&mut self, joint: JointId, register: Register) -> Result<i32, BusError> {
        (**self).read(joint, register)
    }

    fn write(&mut self, joint: JointId, register: Register, value: i32) -> Result<(), BusError> {
        (**self).write(joint, register, value)
    }

    fn scan(&mut self) -> Result<Vec<JointId>, BusError> {
        (**self).scan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_communication_error() {
        let err: ArmError = BusError::Timeout {
            joint: JointId(3),
            register: Register::PresentCurrent,
        }
        .into();
        match err {
            ArmError::Communication { joint, details } => {
                assert_eq!(joint, JointId(3));
                assert!(details.contains("Present_Current"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn worker_gone_maps_to_channel_error() {
        let err: ArmError = BusError::WorkerGone.into();
        assert!(matches!(err, ArmError::Channel(_)));
    }

    #[test]
    fn only_timeouts_and_malformed_are_transient() {
        let joint = JointId(1);
        assert!(
            BusError::Timeout {
                joint,
                register: Register::Moving
            }
            .is_transient()
        );
        assert!(
            !BusError::ReadOnly {
                joint,
                register: Register::Moving
            }
            .is_transient()
        );
        assert!(!BusError::WorkerGone.is_transient());
    }
}
