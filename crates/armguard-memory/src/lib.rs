//! `armguard-memory` – calibration state
//!
//! Holds the one piece of state that outlives a session: each joint's
//! [`CalibrationRecord`][armguard_types::CalibrationRecord].
//!
//! # Modules
//!
//! - [`table`] – [`CalibrationTable`][table::CalibrationTable]: the shared,
//!   lock-protected table every component reads, with optional write-through
//!   persistence.
//! - [`store`] – [`CalibrationStore`][store::CalibrationStore]: one SQLite
//!   table of calibration records per arm, keyed by joint id.

pub mod store;
pub mod table;

pub use store::{CalibrationStore, StoreError};
pub use table::CalibrationTable;
