//! [`Watchdog`] – telemetry freshness monitor.
//!
//! Every recorded sample counts as a heartbeat for its joint. A joint whose
//! last heartbeat is older than its timeout is *stale*: the arm may still be
//! moving, but nobody is watching that joint's temperature or current.
//!
//! Subscribe the watchdog to the [`TelemetryMonitor`][armguard_hal::TelemetryMonitor]
//! and call [`Watchdog::check_all`] from a supervisor loop.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use armguard_hal::TelemetryObserver;
use armguard_types::{JointId, TelemetrySample};
use parking_lot::Mutex;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointHealth {
    /// A sample arrived within the deadline.
    Fresh,
    /// No sample within the deadline.
    Stale,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct JointEntry {
    last_heartbeat: Instant,
    timeout: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks the last sample time of each registered joint.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use armguard_kernel::watchdog::{JointHealth, Watchdog};
/// use armguard_types::JointId;
///
/// let wd = Watchdog::new();
/// wd.register(JointId(1), Duration::from_secs(1));
/// wd.heartbeat(JointId(1));
///
/// assert_eq!(wd.health(JointId(1)), JointHealth::Fresh);
/// ```
#[derive(Default)]
pub struct Watchdog {
    joints: Mutex<BTreeMap<JointId, JointEntry>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `joint` with a maximum silence of `timeout`.
    ///
    /// The joint starts fresh. Re-registering resets its deadline.
    pub fn register(&self, joint: JointId, timeout: Duration) {
        self.joints.lock().insert(
            joint,
            JointEntry {
                last_heartbeat: Instant::now(),
                timeout,
            },
        );
    }

    /// No-op for joints that were never registered.
    pub fn heartbeat(&self, joint: JointId) {
        if let Some(entry) = self.joints.lock().get_mut(&joint) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Unknown joints are reported [`JointHealth::Stale`].
    pub fn health(&self, joint: JointId) -> JointHealth {
        match self.joints.lock().get(&joint) {
            Some(entry) if entry.last_heartbeat.elapsed() <= entry.timeout => JointHealth::Fresh,
            _ => JointHealth::Stale,
        }
    }

    /// Every joint whose deadline has passed, in ascending id order.
    pub fn check_all(&self) -> Vec<JointId> {
        self.joints
            .lock()
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat.elapsed() > entry.timeout)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl TelemetryObserver for Watchdog {
    fn on_sample(&self, sample: &TelemetrySample) {
        self.heartbeat(sample.joint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_joint_is_healthy() {
        let wd = Watchdog::new();
        wd.register(JointId(1), Duration::from_secs(5));
        assert_eq!(wd.health(JointId(1)), JointHealth::Fresh);
    }

    #[test]
    fn heartbeat_resets_deadline() {
        let wd = Watchdog::new();
        wd.register(JointId(2), Duration::from_millis(20));
        thread::sleep(Duration::from_millis(10));
        wd.heartbeat(JointId(2));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(wd.health(JointId(2)), JointHealth::Fresh);
    }

    #[test]
    fn silent_joint_goes_stale() {
        let wd = Watchdog::new();
        wd.register(JointId(3), Duration::from_millis(20));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(wd.health(JointId(3)), JointHealth::Stale);
    }

    #[test]
    fn check_all_returns_stale_joints_only() {
        let wd = Watchdog::new();
        wd.register(JointId(1), Duration::from_millis(20));
        wd.register(JointId(2), Duration::from_secs(60));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(wd.check_all(), vec![JointId(1)]);
    }

    #[test]
    fn samples_count_as_heartbeats() {
        let wd = Watchdog::new();
        wd.register(JointId(4), Duration::from_millis(20));
        thread::sleep(Duration::from_millis(30));
        wd.on_sample(&TelemetrySample {
            joint: JointId(4),
            position: 2048,
            current_ma: 150,
            load: 20,
            temperature_c: 30.0,
            moving: false,
            timestamp: Instant::now(),
        });
        assert_eq!(wd.health(JointId(4)), JointHealth::Fresh);
    }

    #[test]
    fn unknown_joint_is_stale_and_heartbeat_is_noop() {
        let wd = Watchdog::new();
        wd.heartbeat(JointId(9));
        assert_eq!(wd.health(JointId(9)), JointHealth::Stale);
    }
}
