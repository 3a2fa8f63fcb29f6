//! [`ArmService`] – one supervised arm, wired end to end.
//!
//! `connect` spawns the bus worker over a transport, scans the bus and builds
//! every component around the shared handles:
//!
//! ```text
//!              ┌──────────── TelemetryMonitor ────────────┐
//!  BusWorker ──┤  observers: SafetySupervisor, Watchdog    │
//!              └─────┬──────────────┬─────────────┬───────┘
//!              StallDetector   JointCalibrator   DriftMonitor
//!                                    │                │
//!                                    └─ CalibrationTable ─┘
//! ```
//!
//! The methods on this type are what the motion layer is allowed to see.
//! Background monitoring (telemetry poller plus a maintenance thread that
//! enforces the cooling deadline, runs drift checks and watches telemetry
//! freshness) is opt-in via [`ArmService::start_monitoring`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use armguard_hal::{BusTransport, BusWorker, PollerHandle, TelemetryMonitor};
use armguard_kernel::{
    EmergencyStopReport, SafetyStats, SafetySupervisor, SafetyTransition, StallDetector, Watchdog,
};
use armguard_memory::CalibrationTable;
use armguard_middleware::EventBus;
use armguard_types::{ArmError, ArmLayout, CalibrationRecord, HealthScore, JointId, SafetyState};
use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use crate::calibrator::JointCalibrator;
use crate::config::ArmConfig;
use crate::drift::{DriftMonitor, DriftReport};

const STOP_POLL_SLICE: Duration = Duration::from_millis(10);

/// Point-in-time summary for operators.
#[derive(Debug, Clone)]
pub struct ArmStatus {
    pub arm_id: String,
    pub safety_state: SafetyState,
    /// Joints that answered the scan at connect.
    pub present: Vec<JointId>,
    /// Layout joints that did not.
    pub missing: Vec<JointId>,
    /// Joints without a recent telemetry sample.
    pub stale: Vec<JointId>,
    pub calibrated: Vec<JointId>,
    pub read_failures: u64,
    pub stats: SafetyStats,
}

struct Monitoring {
    poller: PollerHandle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Monitoring {
    fn halt(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("maintenance thread panicked");
        }
        self.poller.stop();
    }
}

pub struct ArmService {
    layout: ArmLayout,
    config: ArmConfig,
    worker: Option<BusWorker>,
    telemetry: Arc<TelemetryMonitor>,
    safety: Arc<SafetySupervisor>,
    watchdog: Arc<Watchdog>,
    table: Arc<CalibrationTable>,
    calibrator: JointCalibrator,
    drift: Arc<DriftMonitor>,
    events: EventBus,
    present: Vec<JointId>,
    monitoring: Mutex<Option<Monitoring>>,
    /// Serializes calibration sessions; the bus is shared by every joint.
    session: Mutex<()>,
}

impl ArmService {
    /// Connect to an arm over `transport`.
    ///
    /// Joints of `layout` that do not answer the scan are logged and listed
    /// in [`ArmStatus::missing`]; connecting still succeeds.
    ///
    /// # Errors
    ///
    /// Fails when the bus worker cannot be started or the scan itself fails.
    #[instrument(skip_all, fields(arm_id = %table.arm_id(), joints = layout.len()))]
    pub fn connect<T: BusTransport>(
        transport: T,
        layout: ArmLayout,
        config: ArmConfig,
        table: Arc<CalibrationTable>,
        events: EventBus,
    ) -> Result<Self, ArmError> {
        let worker = BusWorker::spawn(transport, config.bus.clone())?;
        let bus = worker.handle();

        let found = bus.scan()?;
        let joints = layout.ids();
        let present: Vec<JointId> = joints.iter().copied().filter(|j| found.contains(j)).collect();
        for joint in joints.iter().filter(|j| !found.contains(j)) {
            warn!(joint = %joint, "joint did not answer bus scan");
        }

        let telemetry = Arc::new(TelemetryMonitor::new(
            bus.clone(),
            joints.clone(),
            config.telemetry.clone(),
        ));
        let safety = SafetySupervisor::attach(
            bus.clone(),
            Arc::clone(&telemetry),
            joints.clone(),
            config.safety.clone(),
            events.clone(),
        );
        safety.watch_ranges(Arc::clone(&table));
        let watchdog = Arc::new(Watchdog::new());
        for &joint in &joints {
            watchdog.register(joint, config.watchdog.telemetry_timeout());
        }
        telemetry.subscribe(&watchdog);

        let stall = Arc::new(StallDetector::new(
            bus.clone(),
            Arc::clone(&telemetry),
            events.clone(),
            config.stall.clone(),
        ));
        let calibrator = JointCalibrator::new(
            bus,
            Arc::clone(&telemetry),
            stall,
            Arc::clone(&safety),
            Arc::clone(&table),
            events.clone(),
            config.calibration.clone(),
        );
        let drift = Arc::new(DriftMonitor::new(
            Arc::clone(&telemetry),
            Arc::clone(&table),
            layout.clone(),
            events.clone(),
            config.drift.clone(),
        ));

        info!(
            present = present.len(),
            calibrated = table.len(),
            "arm connected"
        );
        Ok(Self {
            layout,
            config,
            worker: Some(worker),
            telemetry,
            safety,
            watchdog,
            table,
            calibrator,
            drift,
            events,
            present,
            monitoring: Mutex::new(None),
            session: Mutex::new(()),
        })
    }

    pub fn layout(&self) -> &ArmLayout {
        &self.layout
    }

    pub fn config(&self) -> &ArmConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn table(&self) -> &Arc<CalibrationTable> {
        &self.table
    }

    pub fn telemetry(&self) -> &Arc<TelemetryMonitor> {
        &self.telemetry
    }

    pub fn get_calibration(&self, joint: JointId) -> Option<CalibrationRecord> {
        self.table.get(joint)
    }

    /// Ask the safety supervisor, on a fresh sample, whether `joint` may move.
    /// Joints outside the layout are never safe.
    pub fn is_safe_to_move(&self, joint: JointId) -> bool {
        self.layout.get(joint).is_some() && self.safety.check(joint)
    }

    /// Calibrate `joints` sequentially; an empty slice means every joint.
    ///
    /// Each joint gets its own result, so one failure never discards records
    /// already committed for others.
    pub fn start_calibration_session(
        &self,
        joints: &[JointId],
    ) -> BTreeMap<JointId, Result<CalibrationRecord, ArmError>> {
        let joints = if joints.is_empty() {
            self.layout.ids()
        } else {
            joints.to_vec()
        };
        let _session = self.session.lock();
        self.calibrator.run_session(&self.layout, &joints)
    }

    pub fn health_score(&self, joint: JointId) -> HealthScore {
        self.drift.health_score(joint)
    }

    pub fn health_report(&self) -> BTreeMap<JointId, HealthScore> {
        self.drift.health_report()
    }

    pub fn check_drift(&self, joint: JointId) -> Result<DriftReport, ArmError> {
        self.drift.check_drift(joint)
    }

    pub fn compensate(&self, joint: JointId) -> Result<Option<(i32, i32)>, ArmError> {
        self.drift.compensate(joint)
    }

    pub fn emergency_stop(&self, cause: &str) -> EmergencyStopReport {
        self.safety.emergency_stop(cause)
    }

    pub fn reset_emergency_stop(&self) -> Result<(), ArmError> {
        self.safety.reset()
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety.state()
    }

    pub fn transitions(&self) -> Vec<SafetyTransition> {
        self.safety.transitions()
    }

    pub fn status(&self) -> ArmStatus {
        let missing = self
            .layout
            .ids()
            .into_iter()
            .filter(|j| !self.present.contains(j))
            .collect();
        ArmStatus {
            arm_id: self.table.arm_id().to_string(),
            safety_state: self.safety.state(),
            present: self.present.clone(),
            missing,
            stale: self.watchdog.check_all(),
            calibrated: self.table.snapshot().into_keys().collect(),
            read_failures: self.telemetry.read_failures(),
            stats: self.safety.stats(),
        }
    }

    /// Start the telemetry poller and the maintenance thread. No-op when
    /// already running.
    pub fn start_monitoring(&self) -> Result<(), ArmError> {
        let mut monitoring = self.monitoring.lock();
        if monitoring.is_some() {
            return Ok(());
        }

        let poller = self.telemetry.spawn_poller()?;
        let stop = Arc::new(AtomicBool::new(false));
        let task = Maintenance {
            telemetry: Arc::clone(&self.telemetry),
            safety: Arc::clone(&self.safety),
            watchdog: Arc::clone(&self.watchdog),
            drift: Arc::clone(&self.drift),
            stop: Arc::clone(&stop),
        };
        let thread = thread::Builder::new()
            .name("armguard-maintenance".to_string())
            .spawn(move || task.run())
            .map_err(|e| ArmError::Channel(format!("failed to spawn maintenance thread: {e}")))?;

        info!(
            check_interval_ms = self.config.drift.check_interval_ms,
            "monitoring started"
        );
        *monitoring = Some(Monitoring {
            poller,
            stop,
            thread: Some(thread),
        });
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        if let Some(monitoring) = self.monitoring.lock().take() {
            monitoring.halt();
            info!("monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.lock().is_some()
    }

    /// Stop monitoring and the bus worker. Torque is left as it is.
    pub fn shutdown(mut self) {
        self.stop_monitoring();
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        info!("arm service shut down");
    }
}

impl Drop for ArmService {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Maintenance thread
// ────────────────────────────────────────────────────────────────────────────

struct Maintenance {
    telemetry: Arc<TelemetryMonitor>,
    safety: Arc<SafetySupervisor>,
    watchdog: Arc<Watchdog>,
    drift: Arc<DriftMonitor>,
    stop: Arc<AtomicBool>,
}

impl Maintenance {
    fn run(self) {
        let interval = self.drift.config().check_interval();
        let auto_compensate = self.drift.config().auto_compensate;
        let mut next_check = Instant::now() + interval;
        let mut reported_stale: Vec<JointId> = Vec::new();

        while !self.stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            self.safety.tick(now);

            // A calibration session owns the bus while the poller is paused.
            if now >= next_check && !self.telemetry.is_paused() {
                next_check = now + interval;
                let flagged = self
                    .drift
                    .run_checks(auto_compensate)
                    .iter()
                    .filter(|r| r.drift)
                    .count();
                if flagged > 0 {
                    warn!(flagged, "drift check flagged joints");
                }

                let stale = self.watchdog.check_all();
                if !stale.is_empty() && stale != reported_stale {
                    error!(joints = ?stale, "telemetry is stale");
                }
                reported_stale = stale;
            }
            thread::sleep(STOP_POLL_SLICE);
        }
    }
}
