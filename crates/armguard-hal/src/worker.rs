//! [`BusWorker`] – the single owner of an arm's bus transport.
//!
//! Only one logical operation may be in flight on a serial bus at a time, so
//! every component talks to the transport through message passing: callers
//! hold a cloneable [`BusHandle`], the worker thread executes requests one by
//! one and sends the result back on a per-request reply channel.
//!
//! # Lanes
//!
//! | Lane | Used by | Caller timeout |
//! |---|---|---|
//! | normal | telemetry polls, calibration steps | `reply_timeout × (retries + 1)` |
//! | urgent | emergency-stop torque writes | `urgent_timeout` |
//!
//! The urgent lane is drained before the normal lane every time the worker
//! picks up a new request, so an emergency stop never waits behind a queue of
//! telemetry reads. A request that is already executing is never preempted;
//! bus round-trips are short and bounded by the transport's own timeout.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use armguard_types::{ArmError, JointId};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::register::Register;
use crate::transport::{BusError, BusTransport};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Extra attempts after a transient failure (timeout / malformed reply).
    pub retries: u32,
    /// Budget for one attempt of a normal request.
    pub reply_timeout_ms: u64,
    /// Budget for an urgent request, retries included.
    pub urgent_timeout_ms: u64,
    /// Capacity of the normal request lane.
    pub queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            reply_timeout_ms: 100,
            urgent_timeout_ms: 50,
            queue_depth: 64,
        }
    }
}

impl BusConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms) * (self.retries + 1)
    }

    pub fn urgent_timeout(&self) -> Duration {
        Duration::from_millis(self.urgent_timeout_ms)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Messages
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Op {
    Read { joint: JointId, register: Register },
    Write { joint: JointId, register: Register, value: i32 },
    Scan,
}

impl Op {
    fn timeout_error(self) -> BusError {
        match self {
            Op::Read { joint, register } | Op::Write { joint, register, .. } => {
                BusError::Timeout { joint, register }
            }
            Op::Scan => BusError::Scan("no reply from bus worker".to_string()),
        }
    }
}

#[derive(Debug)]
enum Reply {
    Value(i32),
    Ack,
    Joints(Vec<JointId>),
}

enum Message {
    Request {
        op: Op,
        reply: Sender<Result<Reply, BusError>>,
    },
    Shutdown,
}

// ────────────────────────────────────────────────────────────────────────────
// BusHandle
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable front door to a running [`BusWorker`].
#[derive(Clone)]
pub struct BusHandle {
    requests: Sender<Message>,
    urgent: Sender<Message>,
    config: BusConfig,
}

impl BusHandle {
    pub fn read(&self, joint: JointId, register: Register) -> Result<i32, BusError> {
        let op = Op::Read { joint, register };
        match self.call(&self.requests, op, self.config.reply_timeout())? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected(op, other)),
        }
    }

    pub fn write(&self, joint: JointId, register: Register, value: i32) -> Result<(), BusError> {
        let op = Op::Write {
            joint,
            register,
            value,
        };
        match self.call(&self.requests, op, self.config.reply_timeout())? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(op, other)),
        }
    }

    /// Write through the urgent lane with the short urgent timeout.
    pub fn write_urgent(
        &self,
        joint: JointId,
        register: Register,
        value: i32,
    ) -> Result<(), BusError> {
        let op = Op::Write {
            joint,
            register,
            value,
        };
        match self.call(&self.urgent, op, self.config.urgent_timeout())? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(op, other)),
        }
    }

    pub fn scan(&self) -> Result<Vec<JointId>, BusError> {
        let timeout = self.config.reply_timeout();
        match self.call(&self.requests, Op::Scan, timeout)? {
            Reply::Joints(joints) => Ok(joints),
            other => Err(BusError::Scan(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn call(&self, lane: &Sender<Message>, op: Op, timeout: Duration) -> Result<Reply, BusError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        lane.send_timeout(
            Message::Request {
                op,
                reply: reply_tx,
            },
            timeout,
        )
        .map_err(|e| match e {
            SendTimeoutError::Timeout(_) => op.timeout_error(),
            SendTimeoutError::Disconnected(_) => BusError::WorkerGone,
        })?;

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(op.timeout_error()),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::WorkerGone),
        }
    }
}

fn unexpected(op: Op, reply: Reply) -> BusError {
    match op {
        Op::Read { joint, register } | Op::Write { joint, register, .. } => BusError::Malformed {
            joint,
            register,
            details: format!("unexpected reply {reply:?}"),
        },
        Op::Scan => BusError::Scan(format!("unexpected reply {reply:?}")),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BusWorker
// ────────────────────────────────────────────────────────────────────────────

/// Owns the worker thread. Dropping it stops the thread.
pub struct BusWorker {
    handle: BusHandle,
    thread: Option<JoinHandle<()>>,
}

impl BusWorker {
    /// Move `transport` onto a dedicated thread and start serving requests.
    pub fn spawn<T: BusTransport>(transport: T, config: BusConfig) -> Result<Self, ArmError> {
        let (requests_tx, requests_rx) = crossbeam_channel::bounded(config.queue_depth.max(1));
        let (urgent_tx, urgent_rx) = crossbeam_channel::unbounded();
        let retries = config.retries;

        let thread = thread::Builder::new()
            .name("armguard-bus".to_string())
            .spawn(move || run(transport, requests_rx, urgent_rx, retries))
            .map_err(|e| ArmError::Channel(format!("failed to spawn bus worker: {e}")))?;

        info!(retries, reply_timeout_ms = config.reply_timeout_ms, "bus worker started");
        Ok(Self {
            handle: BusHandle {
                requests: requests_tx,
                urgent: urgent_tx,
                config,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Stop the worker thread and wait for it to exit.
    ///
    /// Outstanding handles keep working as values but every call returns
    /// [`BusError::WorkerGone`].
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.urgent.send(Message::Shutdown);
            if thread.join().is_err() {
                warn!("bus worker thread panicked");
            }
            info!("bus worker stopped");
        }
    }
}

impl Drop for BusWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: BusTransport>(
    mut transport: T,
    requests: Receiver<Message>,
    urgent: Receiver<Message>,
    retries: u32,
) {
    loop {
        let message = match urgent.try_recv() {
            Ok(message) => message,
            Err(_) => crossbeam_channel::select! {
                recv(urgent) -> msg => match msg {
                    Ok(message) => message,
                    Err(_) => break,
                },
                recv(requests) -> msg => match msg {
                    Ok(message) => message,
                    Err(_) => break,
                },
            },
        };

        match message {
            Message::Shutdown => break,
            Message::Request { op, reply } => {
                let result = execute(&mut transport, op, retries);
                // The caller may have timed out and gone away.
                let _ = reply.send(result);
            }
        }
    }
}

fn execute<T: BusTransport>(transport: &mut T, op: Op, retries: u32) -> Result<Reply, BusError> {
    if let Op::Write {
        joint, register, ..
    } = op
        && !register.is_writable()
    {
        return Err(BusError::ReadOnly { joint, register });
    }

    let mut attempt = 0;
    loop {
        let result = match op {
            Op::Read { joint, register } => transport.read(joint, register).map(Reply::Value),
            Op::Write {
                joint,
                register,
                value,
            } => transport.write(joint, register, value).map(|()| Reply::Ack),
            Op::Scan => transport.scan().map(Reply::Joints),
        };

        match result {
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                debug!(attempt, error = %err, "retrying bus request");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Fails the first `failures` calls with a timeout, then answers `value`.
    struct FlakyTransport {
        failures: u32,
        calls: Arc<Mutex<u32>>,
        value: i32,
    }

    impl BusTransport for FlakyTransport {
        fn read(&mut self, joint: JointId, register: Register) -> Result<i32, BusError> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls <= self.failures {
                Err(BusError::Timeout { joint, register })
            } else {
                Ok(self.value)
            }
        }

        fn write(&mut self, _: JointId, _: Register, _: i32) -> Result<(), BusError> {
            Ok(())
        }

        fn scan(&mut self) -> Result<Vec<JointId>, BusError> {
            Ok(vec![JointId(1), JointId(2)])
        }
    }

    fn flaky(failures: u32) -> (FlakyTransport, Arc<Mutex<u32>>) {
        let calls = Arc::new(Mutex::new(0));
        (
            FlakyTransport {
                failures,
                calls: Arc::clone(&calls),
                value: 2048,
            },
            calls,
        )
    }

    #[test]
    fn transient_failures_are_retried() {
        let (transport, calls) = flaky(2);
        let worker = BusWorker::spawn(transport, BusConfig::default()).unwrap();
        let bus = worker.handle();

        assert_eq!(bus.read(JointId(1), Register::PresentPosition).unwrap(), 2048);
        assert_eq!(*calls.lock(), 3);
    }

    #[test]
    fn failure_surfaces_after_retry_budget() {
        let (transport, calls) = flaky(10);
        let worker = BusWorker::spawn(transport, BusConfig::default()).unwrap();
        let bus = worker.handle();

        let err = bus.read(JointId(4), Register::PresentCurrent).unwrap_err();
        assert_eq!(
            err,
            BusError::Timeout {
                joint: JointId(4),
                register: Register::PresentCurrent
            }
        );
        assert_eq!(*calls.lock(), 3);
    }

    #[test]
    fn writes_to_read_only_registers_are_rejected() {
        let (transport, _) = flaky(0);
        let worker = BusWorker::spawn(transport, BusConfig::default()).unwrap();
        let err = worker
            .handle()
            .write(JointId(1), Register::PresentPosition, 10)
            .unwrap_err();
        assert!(matches!(err, BusError::ReadOnly { .. }));
    }

    #[test]
    fn scan_lists_joints() {
        let (transport, _) = flaky(0);
        let worker = BusWorker::spawn(transport, BusConfig::default()).unwrap();
        assert_eq!(worker.handle().scan().unwrap(), vec![JointId(1), JointId(2)]);
    }

    #[test]
    fn calls_after_shutdown_report_worker_gone() {
        let (transport, _) = flaky(0);
        let worker = BusWorker::spawn(transport, BusConfig::default()).unwrap();
        let bus = worker.handle();
        worker.shutdown();

        let err = bus.read(JointId(1), Register::Moving).unwrap_err();
        assert_eq!(err, BusError::WorkerGone);
    }

    /// Blocks the first read until released, and logs the order of requests.
    struct GatedTransport {
        gate: Receiver<()>,
        log: Arc<Mutex<Vec<&'static str>>>,
        gated: bool,
    }

    impl BusTransport for GatedTransport {
        fn read(&mut self, _: JointId, _: Register) -> Result<i32, BusError> {
            if !self.gated {
                self.gated = true;
                let _ = self.gate.recv();
                self.log.lock().push("first");
            } else {
                self.log.lock().push("read");
            }
            Ok(0)
        }

        fn write(&mut self, _: JointId, _: Register, _: i32) -> Result<(), BusError> {
            self.log.lock().push("urgent");
            Ok(())
        }

        fn scan(&mut self) -> Result<Vec<JointId>, BusError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn urgent_lane_jumps_the_queue() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let transport = GatedTransport {
            gate: gate_rx,
            log: Arc::clone(&log),
            gated: false,
        };
        let config = BusConfig {
            reply_timeout_ms: 2_000,
            urgent_timeout_ms: 2_000,
            ..BusConfig::default()
        };
        let worker = BusWorker::spawn(transport, config).unwrap();

        let first = {
            let bus = worker.handle();
            thread::spawn(move || bus.read(JointId(1), Register::PresentPosition))
        };
        thread::sleep(Duration::from_millis(30));
        let queued = {
            let bus = worker.handle();
            thread::spawn(move || bus.read(JointId(2), Register::PresentPosition))
        };
        thread::sleep(Duration::from_millis(30));
        let urgent = {
            let bus = worker.handle();
            thread::spawn(move || bus.write_urgent(JointId(1), Register::TorqueEnable, 0))
        };
        thread::sleep(Duration::from_millis(30));
        gate_tx.send(()).unwrap();

        first.join().unwrap().unwrap();
        queued.join().unwrap().unwrap();
        urgent.join().unwrap().unwrap();
        assert_eq!(*log.lock(), vec!["first", "urgent", "read"]);
    }
}
