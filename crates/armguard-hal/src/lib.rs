//! `armguard-hal` – Hardware Abstraction Layer for the arm bus
//!
//! Everything that touches the shared serial bus lives here. Higher layers
//! never own a transport; they hold a cloneable [`BusHandle`] and go through
//! the single per-arm [`BusWorker`] thread.
//!
//! # Modules
//!
//! - [`register`] – [`Register`][register::Register]: the control-table
//!   entries this layer reads and writes.
//! - [`transport`] – [`BusTransport`][transport::BusTransport]: the
//!   read/write/scan primitives a concrete bus driver provides, plus
//!   [`BusError`][transport::BusError].
//! - [`worker`] – [`BusWorker`][worker::BusWorker] and
//!   [`BusHandle`][worker::BusHandle]: serialized, retried bus access with a
//!   priority lane for emergency-stop writes.
//! - [`telemetry`] – [`TelemetryMonitor`][telemetry::TelemetryMonitor]:
//!   per-joint sampling, ring-buffered history and the background poller.
//! - [`sim`] – [`SimBus`][sim::SimBus]: an in-process simulated arm for tests
//!   and headless runs.

pub mod register;
pub mod sim;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use register::Register;
pub use sim::{SimBus, SimController, SimJoint, SimReading};
pub use telemetry::{PauseGuard, PollerHandle, TelemetryConfig, TelemetryMonitor, TelemetryObserver};
pub use transport::{BusError, BusTransport};
pub use worker::{BusConfig, BusHandle, BusWorker};
