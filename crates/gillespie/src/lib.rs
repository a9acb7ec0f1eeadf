#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! Stochastic simulation of a genetic toggle switch, one Gillespie reaction
//! per system per step, run across many independent systems on a compute
//! device. Switch residence times are collected periodically into an
//! append-only measurement file.

mod error;
pub mod kernels;
pub mod model;
pub mod sim;
pub mod sink;

pub use error::{Result, SimError};
pub use model::{SystemState, ToggleSwitchParams, PARAM_COUNT};
pub use sim::{SimConfig, SwitchSimulation};
pub use sink::MeasurementSink;

#[cfg(feature = "cpu")]
pub use kernels::host_library;
