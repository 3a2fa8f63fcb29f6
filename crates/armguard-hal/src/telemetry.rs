//! [`TelemetryMonitor`] – per-joint sampling and bounded sample history.
//!
//! A sample is one blocking pass over the joint's sensor registers through
//! the bus worker. Every sample lands in a fixed-capacity ring buffer (oldest
//! evicted first) and is pushed to the registered [`TelemetryObserver`]s,
//! which is how the safety supervisor sees every reading no matter who asked
//! for it.
//!
//! The background poller ([`TelemetryMonitor::spawn_poller`]) samples every
//! joint at `poll_rate_hz`. A failed read is logged and skipped; the cycle
//! carries on with the next joint. The calibrator pauses the poller with
//! [`TelemetryMonitor::pause`] and samples synchronously instead, so its
//! safety decisions are never made on a stale cached value.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use armguard_types::{ArmError, JointId, TelemetrySample};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::register::Register;
use crate::transport::BusError;
use crate::worker::BusHandle;

/// Granularity at which a sleeping poller notices a stop request.
const STOP_POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub poll_rate_hz: f64,
    /// Ring-buffer capacity per joint.
    pub history_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_rate_hz: 10.0,
            history_capacity: 100,
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.poll_rate_hz.max(0.1))
    }
}

/// Receives every sample the monitor records.
///
/// Called on whichever thread took the sample; implementations must be quick
/// and must not call back into [`TelemetryMonitor::sample`].
pub trait TelemetryObserver: Send + Sync {
    fn on_sample(&self, sample: &TelemetrySample);

    fn on_read_failure(&self, _joint: JointId, _error: &BusError) {}
}

// ────────────────────────────────────────────────────────────────────────────
// TelemetryMonitor
// ────────────────────────────────────────────────────────────────────────────

pub struct TelemetryMonitor {
    bus: BusHandle,
    joints: Vec<JointId>,
    config: TelemetryConfig,
    history: RwLock<HashMap<JointId, VecDeque<TelemetrySample>>>,
    observers: RwLock<Vec<Weak<dyn TelemetryObserver>>>,
    read_failures: AtomicU64,
    pauses: AtomicUsize,
}

impl TelemetryMonitor {
    pub fn new(bus: BusHandle, joints: Vec<JointId>, config: TelemetryConfig) -> Self {
        let history = joints
            .iter()
            .map(|id| (*id, VecDeque::with_capacity(config.history_capacity)))
            .collect();
        Self {
            bus,
            joints,
            config,
            history: RwLock::new(history),
            observers: RwLock::new(Vec::new()),
            read_failures: AtomicU64::new(0),
            pauses: AtomicUsize::new(0),
        }
    }

    pub fn joints(&self) -> &[JointId] {
        &self.joints
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Register an observer. Only a weak reference is kept, so observers that
    /// themselves hold the monitor do not form a cycle.
    pub fn subscribe<O: TelemetryObserver + 'static>(&self, observer: &Arc<O>) {
        let weak = Arc::downgrade(observer);
        let weak: Weak<dyn TelemetryObserver> = weak;
        self.observers.write().push(weak);
    }

    /// Take a fresh sample of `joint` over the bus and record it.
    ///
    /// # Errors
    ///
    /// [`ArmError::UnknownJoint`] for joints the monitor does not track,
    /// [`ArmError::Communication`] when any register read fails after retries.
    pub fn sample(&self, joint: JointId) -> Result<TelemetrySample, ArmError> {
        if !self.joints.contains(&joint) {
            return Err(ArmError::UnknownJoint(joint));
        }
        match self.read_sample(joint) {
            Ok(sample) => {
                self.record(sample);
                Ok(sample)
            }
            Err(err) => {
                self.read_failures.fetch_add(1, Ordering::Relaxed);
                for observer in self.live_observers() {
                    observer.on_read_failure(joint, &err);
                }
                Err(err.into())
            }
        }
    }

    fn read_sample(&self, joint: JointId) -> Result<TelemetrySample, BusError> {
        let position = self.bus.read(joint, Register::PresentPosition)?;
        let current = self.bus.read(joint, Register::PresentCurrent)?;
        let load = self.bus.read(joint, Register::PresentLoad)?;
        let temperature = self.bus.read(joint, Register::PresentTemperature)?;
        let moving = self.bus.read(joint, Register::Moving)?;
        Ok(TelemetrySample {
            joint,
            position,
            current_ma: current.unsigned_abs(),
            load: load.unsigned_abs().min(u32::from(u16::MAX)) as u16,
            temperature_c: temperature as f32,
            moving: moving != 0,
            timestamp: Instant::now(),
        })
    }

    /// Append an externally obtained sample and notify observers.
    pub fn record(&self, sample: TelemetrySample) {
        {
            let mut history = self.history.write();
            let ring = history.entry(sample.joint).or_default();
            while ring.len() >= self.config.history_capacity.max(1) {
                ring.pop_front();
            }
            ring.push_back(sample);
        }
        for observer in self.live_observers() {
            observer.on_sample(&sample);
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn TelemetryObserver>> {
        let mut observers = self.observers.write();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn latest(&self, joint: JointId) -> Option<TelemetrySample> {
        self.history.read().get(&joint).and_then(|ring| ring.back().copied())
    }

    /// Samples taken within the last `window`, oldest first.
    pub fn history(&self, joint: JointId, window: Duration) -> Vec<TelemetrySample> {
        let cutoff = Instant::now().checked_sub(window);
        self.history
            .read()
            .get(&joint)
            .map(|ring| {
                ring.iter()
                    .filter(|s| cutoff.is_none_or(|c| s.timestamp >= c))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The newest `n` samples, oldest first.
    pub fn recent(&self, joint: JointId, n: usize) -> Vec<TelemetrySample> {
        self.history
            .read()
            .get(&joint)
            .map(|ring| ring.iter().skip(ring.len().saturating_sub(n)).copied().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, joint: JointId) {
        if let Some(ring) = self.history.write().get_mut(&joint) {
            ring.clear();
        }
    }

    /// Best-effort sample of every joint. Returns how many succeeded.
    pub fn poll_once(&self) -> usize {
        let mut ok = 0;
        for &joint in &self.joints {
            match self.sample(joint) {
                Ok(_) => ok += 1,
                Err(err) => warn!(joint = %joint, error = %err, "telemetry read failed; skipping joint"),
            }
        }
        ok
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    /// Suspend the background poller until the guard is dropped. Nests.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        debug!("telemetry poller paused");
        PauseGuard { monitor: self }
    }

    pub fn is_paused(&self) -> bool {
        self.pauses.load(Ordering::SeqCst) > 0
    }

    /// Start polling every joint at the configured rate on a background thread.
    pub fn spawn_poller(self: &Arc<Self>) -> Result<PollerHandle, ArmError> {
        let stop = Arc::new(AtomicBool::new(false));
        let monitor = Arc::downgrade(self);
        let interval = self.config.poll_interval();
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("armguard-telemetry".to_string())
            .spawn(move || poll_loop(monitor, interval, thread_stop))
            .map_err(|e| ArmError::Channel(format!("failed to spawn telemetry poller: {e}")))?;

        info!(poll_rate_hz = self.config.poll_rate_hz, "telemetry poller started");
        Ok(PollerHandle {
            stop,
            thread: Some(thread),
        })
    }
}

fn poll_loop(monitor: Weak<TelemetryMonitor>, interval: Duration, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let started = Instant::now();
        {
            let Some(monitor) = monitor.upgrade() else {
                break;
            };
            if !monitor.is_paused() {
                monitor.poll_once();
            }
        }
        let deadline = started + interval;
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_POLL_SLICE));
        }
    }
}

/// Resumes the poller when dropped.
pub struct PauseGuard<'a> {
    monitor: &'a TelemetryMonitor,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.monitor.pauses.fetch_sub(1, Ordering::SeqCst);
        debug!("telemetry poller resumed");
    }
}

/// Stops the poller thread when dropped.
pub struct PollerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("telemetry poller thread panicked");
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.halt();
    }
}
