//! Building blocks of the acquisition worker.

pub mod acquisition;
pub mod connection;
pub mod features;
pub mod frame_waiter;
pub mod metadata;
pub mod sync_gate;
pub mod telemetry;
