//! Physical sensor adapters.
//!
//! Each engine (gyro, accel, compass, pressure, and the gyro's temperature
//! channel) is driven through a [`PhysicalSensor`]. Absent engines are `None`
//! in [`Engines`].

use crate::types::Engine;
use crate::Result;

/// Static description of a physical sensor as reported to the framework.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorDescriptor {
    pub handle: i32,
    /// Milliamps.
    pub power: f32,
    pub max_range: f32,
    pub min_delay_us: i64,
    pub fifo_reserved_event_count: u32,
    pub fifo_max_event_count: u32,
    pub version: i32,
}

/// One event read back from an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    Sample { values: [i32; 3], timestamp: i64 },
    /// Acknowledgement of an earlier [`PhysicalSensor::flush`].
    FlushComplete,
}

/// Driver contract for one physical engine.
pub trait PhysicalSensor: Send {
    fn enable(&mut self, on: bool) -> Result<()>;

    /// Requested sampling period in nanoseconds.
    fn set_delay(&mut self, period_ns: i64) -> Result<()>;

    /// Period the hardware actually runs at, in nanoseconds.
    fn get_delay(&mut self) -> Result<i64>;

    fn batch(&mut self, flags: i32, period_ns: i64, timeout_ns: i64) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn read_events(&mut self, max: usize) -> Result<Vec<AdapterEvent>>;

    /// Single raw reading, used for the temperature channel.
    fn read_raw(&mut self) -> Result<i32>;

    fn scale(&self) -> f64;

    fn set_scale(&mut self, scale: f64);

    fn offset(&self) -> f64 {
        0.0
    }

    /// Mounting matrix, row-major.
    fn matrix(&self) -> [i8; 9];

    fn set_matrix(&mut self, matrix: [i8; 9]);

    /// Full-scale range in the driver's native units.
    fn peak_raw(&self) -> f32;

    fn set_offset(&mut self, axis: usize, offset: f32) -> Result<()>;

    fn descriptor(&self) -> SensorDescriptor;
}

/// The set of adapters wired into a [`crate::MotionHal`].
#[derive(Default)]
pub struct Engines {
    pub gyro: Option<Box<dyn PhysicalSensor>>,
    pub gyro_temp: Option<Box<dyn PhysicalSensor>>,
    pub accel: Option<Box<dyn PhysicalSensor>>,
    pub compass: Option<Box<dyn PhysicalSensor>>,
    pub pressure: Option<Box<dyn PhysicalSensor>>,
}

impl Engines {
    pub fn get(&self, engine: Engine) -> Option<&dyn PhysicalSensor> {
        match engine {
            Engine::Gyro => self.gyro.as_deref(),
            Engine::Accel => self.accel.as_deref(),
            Engine::Compass => self.compass.as_deref(),
            Engine::Pressure => self.pressure.as_deref(),
        }
    }

    pub fn get_mut(&mut self, engine: Engine) -> Option<&mut (dyn PhysicalSensor + 'static)> {
        match engine {
            Engine::Gyro => self.gyro.as_deref_mut(),
            Engine::Accel => self.accel.as_deref_mut(),
            Engine::Compass => self.compass.as_deref_mut(),
            Engine::Pressure => self.pressure.as_deref_mut(),
        }
    }

    pub fn has(&self, engine: Engine) -> bool {
        self.get(engine).is_some()
    }

    pub fn has_compass(&self) -> bool {
        self.compass.is_some()
    }
}

impl std::fmt::Debug for Engines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engines")
            .field("gyro", &self.gyro.is_some())
            .field("gyro_temp", &self.gyro_temp.is_some())
            .field("accel", &self.accel.is_some())
            .field("compass", &self.compass.is_some())
            .field("pressure", &self.pressure.is_some())
            .finish()
    }
}
