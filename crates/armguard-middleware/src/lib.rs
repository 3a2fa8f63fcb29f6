//! `armguard-middleware` – event routing
//!
//! Carries safety transitions, calibration results and health advisories
//! from the components that produce them to whoever is listening (the CLI,
//! a dashboard, a teleoperation supervisor) without either side knowing
//! about the other.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
