//! Hardware drivers.
//!
//! The demo driver lives in its own crate (`acq-driver-demo`); everything
//! that talks to a real transport lives here.

// Framed-binary multimeters over serial or raw TCP
pub mod serial_dmm;

pub use serial_dmm::{Reading, SerialDmmDriver};
