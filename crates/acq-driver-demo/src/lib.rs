//! Demo driver for rust-acq.
//!
//! A virtual device that needs no hardware: logic channels carry a test
//! pattern (`sigrok`, `random`, `incremental`, `all-low`, `all-high`) and
//! analog channels a waveform (`square`, `sine`, `triangle`, `sawtooth`),
//! paced against the configured samplerate.
//!
//! ```
//! use acq_core::config::{ConfigKey, ConfigValue};
//! use acq_core::{driver, Packet, Session};
//! use acq_driver_demo::DRIVER;
//!
//! let device = driver::driver_scan(&DRIVER, &[]).unwrap().remove(0);
//! {
//!     let mut sdi = device.lock();
//!     driver::open(&mut sdi).unwrap();
//!     driver::config_set(&mut sdi, None, ConfigKey::LimitSamples, ConfigValue::UInt64(100)).unwrap();
//! }
//!
//! let session = Session::new().unwrap();
//! session.add_device(&device).unwrap();
//! session.add_datafeed_callback(|_, packet| {
//!     if let Packet::Logic(logic) = packet {
//!         assert_eq!(logic.unit_size(), 1);
//!     }
//! });
//! session.start().unwrap();
//! session.run().unwrap();
//! ```

mod demo;
pub mod pattern;
pub mod rng;

pub use demo::{
    set_random_seed, DemoDriver, DEFAULT_NUM_ANALOG_CHANNELS, DEFAULT_NUM_LOGIC_CHANNELS,
    DEFAULT_SAMPLERATE, LOGIC_BUFSIZE,
};
pub use pattern::{AnalogPattern, LogicGenerator, LogicPattern};
pub use rng::DemoRng;

/// The driver instance linked into the registry.
pub static DRIVER: DemoDriver = DemoDriver::new();
