//! # motionhal - motion sensor HAL core for IMUs with an on-chip DMP
//!
//! Drives a gyro/accel/compass/pressure stack behind an IIO sysfs interface. Provides:
//! - Per-sensor enable, rate and batch state machine over shared physical engines
//! - DMP feature selection (low-power, 6-axis and pedometer quaternions, step
//!   detector and counter, significant motion)
//! - Streaming decoder for the DMP FIFO wire format
//! - Event dispatch with flush-complete bookkeeping and bias handling
//! - C FFI for integration with a native sensor service
//!
//! ## Quick Start
//! ```no_run
//! use motionhal::{Engines, HalConfig, MotionHal, SensorKind};
//! # fn fusion() -> Box<dyn motionhal::Fusion> { unimplemented!() }
//! # fn engines() -> Engines { Engines::default() }
//!
//! let mut hal = MotionHal::open(HalConfig::from_env(), engines(), fusion())?;
//! hal.enable(SensorKind::GameRotationVector, true)?;
//! hal.set_delay(SensorKind::GameRotationVector, 20_000_000)?;
//!
//! for _ in 0..100 {
//!     let chunk: Vec<u8> = Vec::new(); // read from the IIO FIFO node
//!     hal.feed_fifo(&chunk);
//!     for event in hal.read_events(32) {
//!         println!("{:?}", event);
//!     }
//! }
//! # Ok::<(), motionhal::HalError>(())
//! ```

pub mod error;
pub mod types;
pub mod protocol;
pub mod sysfs;
pub mod adapter;
pub mod fusion;
pub mod selector;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod dmp;
pub mod dispatch;
pub mod ffi;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{AdapterEvent, Engines, PhysicalSensor, SensorDescriptor};
pub use config::{HalConfig, LogConfig};
pub use engine::{BatchOutcome, MotionHal, BATCH_DRY_RUN, BATCH_WAKE_UPON_FIFO_FULL};
pub use error::HalError;
pub use fusion::{Fusion, FusionMessage, FusionOutput, FusionRate, Notifier};
pub use protocol::{Decoder, Outcome};
pub use sysfs::{Attr, IioSysfs, SysfsAttrs};
pub use types::*;

/// Result type alias for motionhal operations.
pub type Result<T> = std::result::Result<T, HalError>;
