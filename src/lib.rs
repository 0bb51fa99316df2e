//! # raildispatch
//!
//! A light-rail dispatching and train control core. Three subsystems share a
//! single simulated clock and exchange data every tick:
//!
//! - the central traffic controller ([`control::ctc::CtcSystem`]) dispatches
//!   trains, generates routes and issues per-block speed/authority commands,
//! - the wayside controllers ([`control::wayside::WaysideController`]) run
//!   PLC programs over block occupancy and translate the CTC suggestions
//!   into safe per-block commands,
//! - the train controllers ([`control::train_controller::TrainController`])
//!   regulate traction power with a PID loop under driver, failure and
//!   station-stop constraints.
//!
//! [`control::system::TrafficControlSystem`] wires the subsystems to the
//! clock. UI layers, track-file parsing and physical train models stay
//! outside this crate and talk to it through the message shapes declared in
//! [`control::ctc::comm`] and [`control::train_controller::types`].

/// The control fabric: clock, CTC, waysides and train controllers.
pub mod control;
/// Shared primitive types and unit conversions.
pub mod general;
