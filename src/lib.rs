//! # camdaq
//!
//! Application layer of the camera acquisition core. The acquisition
//! machinery itself lives in the workspace crates:
//!
//! - **`camdaq-core`**: error taxonomy, cancellation, settings, frames and
//!   connection status.
//! - **`camdaq-pool`**: frame buffers and the buffer pipeline kept submitted
//!   to the hardware.
//! - **`camdaq-driver`**: metadata parser, frame waiter, sync gate,
//!   reconnection state machine, acquisition loop and `CameraDriver`.
//!
//! This crate adds:
//!
//! - **`config`**: layered configuration (defaults, TOML file, `CAMDAQ_`
//!   environment variables) loaded with `figment`.
//! - **`tracing_setup`**: subscriber initialisation for the `camdaq` binary.

pub mod config;
pub mod tracing_setup;
