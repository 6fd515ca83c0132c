use std::fmt;

/// Every sensor the HAL exposes, physical and virtual.
///
/// The discriminant is the bit index used by [`SensorMask`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorKind {
    Gyro = 0,
    RawGyro = 1,
    Accelerometer = 2,
    MagneticField = 3,
    RawMagneticField = 4,
    Pressure = 5,
    Orientation = 6,
    RotationVector = 7,
    GameRotationVector = 8,
    LinearAccel = 9,
    Gravity = 10,
    SignificantMotion = 11,
    StepDetector = 12,
    StepCounter = 13,
    GeomagneticRotationVector = 14,
}

impl SensorKind {
    pub const COUNT: usize = 15;

    pub const ALL: [SensorKind; SensorKind::COUNT] = [
        SensorKind::Gyro,
        SensorKind::RawGyro,
        SensorKind::Accelerometer,
        SensorKind::MagneticField,
        SensorKind::RawMagneticField,
        SensorKind::Pressure,
        SensorKind::Orientation,
        SensorKind::RotationVector,
        SensorKind::GameRotationVector,
        SensorKind::LinearAccel,
        SensorKind::Gravity,
        SensorKind::SignificantMotion,
        SensorKind::StepDetector,
        SensorKind::StepCounter,
        SensorKind::GeomagneticRotationVector,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<SensorKind> {
        Self::ALL.get(index).copied()
    }

    /// Map an external handle (index + 1, as handed to the framework) to a kind.
    pub fn from_handle(handle: i32) -> Option<SensorKind> {
        usize::try_from(handle)
            .ok()
            .and_then(|h| h.checked_sub(1))
            .and_then(Self::from_index)
    }

    pub fn handle(self) -> i32 {
        self as i32 + 1
    }

    pub fn bit(self) -> SensorMask {
        SensorMask::from_bits_truncate(1 << self as u32)
    }

    pub fn is_physical(self) -> bool {
        self <= SensorKind::Pressure
    }

    /// Kinds that never touch `enabled`: they are driven by dedicated DMP engines.
    pub fn is_dmp_only(self) -> bool {
        matches!(
            self,
            SensorKind::SignificantMotion | SensorKind::StepDetector | SensorKind::StepCounter
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Gyro => "gyro",
            SensorKind::RawGyro => "raw_gyro",
            SensorKind::Accelerometer => "accel",
            SensorKind::MagneticField => "mag",
            SensorKind::RawMagneticField => "raw_mag",
            SensorKind::Pressure => "pressure",
            SensorKind::Orientation => "orientation",
            SensorKind::RotationVector => "rv",
            SensorKind::GameRotationVector => "grv",
            SensorKind::LinearAccel => "linear_accel",
            SensorKind::Gravity => "gravity",
            SensorKind::SignificantMotion => "smd",
            SensorKind::StepDetector => "step_detector",
            SensorKind::StepCounter => "step_counter",
            SensorKind::GeomagneticRotationVector => "gmrv",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags::bitflags! {
    /// Bitmask over [`SensorKind`], used for both the enable and the batch masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct SensorMask: u32 {
        const GYRO                 = 1 << 0;
        const RAW_GYRO             = 1 << 1;
        const ACCEL                = 1 << 2;
        const MAGNETIC_FIELD       = 1 << 3;
        const RAW_MAGNETIC_FIELD   = 1 << 4;
        const PRESSURE             = 1 << 5;
        const ORIENTATION          = 1 << 6;
        const ROTATION_VECTOR      = 1 << 7;
        const GAME_ROTATION_VECTOR = 1 << 8;
        const LINEAR_ACCEL         = 1 << 9;
        const GRAVITY              = 1 << 10;
        const SIGNIFICANT_MOTION   = 1 << 11;
        const STEP_DETECTOR        = 1 << 12;
        const STEP_COUNTER         = 1 << 13;
        const GEOMAG_ROTATION_VECTOR = 1 << 14;

        /// Consumers of full 9-axis fusion.
        const NINE_AXIS = Self::ORIENTATION.bits()
            | Self::ROTATION_VECTOR.bits()
            | Self::LINEAR_ACCEL.bits()
            | Self::GRAVITY.bits();
        const GYRO_SIX_AXIS = Self::GAME_ROTATION_VECTOR.bits();
        const MAG_SIX_AXIS = Self::GEOMAG_ROTATION_VECTOR.bits();
        const ALL_FUSION = Self::NINE_AXIS.bits()
            | Self::GYRO_SIX_AXIS.bits()
            | Self::MAG_SIX_AXIS.bits();
        const HARDWARE = Self::GYRO.bits()
            | Self::RAW_GYRO.bits()
            | Self::ACCEL.bits()
            | Self::MAGNETIC_FIELD.bits()
            | Self::RAW_MAGNETIC_FIELD.bits()
            | Self::PRESSURE.bits();
    }
}

impl SensorMask {
    pub fn has(self, kind: SensorKind) -> bool {
        self.contains(kind.bit())
    }

    pub fn kinds(self) -> impl Iterator<Item = SensorKind> {
        SensorKind::ALL.into_iter().filter(move |k| self.has(*k))
    }
}

/// A physical sensing engine behind one or more [`SensorKind`]s.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Gyro = 0,
    Accel = 1,
    Compass = 2,
    Pressure = 3,
}

impl Engine {
    pub const ALL: [Engine; 4] = [Engine::Gyro, Engine::Accel, Engine::Compass, Engine::Pressure];

    pub fn mask(self) -> EngineMask {
        match self {
            Engine::Gyro => EngineMask::GYRO,
            Engine::Accel => EngineMask::ACCEL,
            Engine::Compass => EngineMask::COMPASS,
            Engine::Pressure => EngineMask::PRESSURE,
        }
    }

    /// The sensor kind whose flush acknowledgement this engine produces.
    pub fn flush_kind(self) -> SensorKind {
        match self {
            Engine::Gyro => SensorKind::Gyro,
            Engine::Accel => SensorKind::Accelerometer,
            Engine::Compass => SensorKind::MagneticField,
            Engine::Pressure => SensorKind::Pressure,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Engine::Gyro => "gyro",
            Engine::Accel => "accel",
            Engine::Compass => "compass",
            Engine::Pressure => "pressure",
        })
    }
}

bitflags::bitflags! {
    /// Local sensor mask: which engine groups must be producing FIFO data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct EngineMask: u32 {
        const GYRO     = 0x000F;
        const ACCEL    = 0x0070;
        const COMPASS  = 0x0380;
        const PRESSURE = 0x0400;

        /// Every engine except pressure.
        const FUSION = Self::GYRO.bits() | Self::ACCEL.bits() | Self::COMPASS.bits();
    }
}

impl EngineMask {
    pub fn has(self, engine: Engine) -> bool {
        self.intersects(engine.mask())
    }

    pub fn set_engine(&mut self, engine: Engine, on: bool) {
        self.set(engine.mask(), on);
    }
}

bitflags::bitflags! {
    /// DMP features currently running on the motion processor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct Features: u32 {
        /// Low-power 3-axis quaternion.
        const QUATERNION          = 0x001;
        const DISPL_ORIENTATION   = 0x002;
        const SIGNIFICANT_MOTION  = 0x004;
        /// Pedometer in interrupt (step detector) mode.
        const PEDOMETER           = 0x008;
        /// Pedometer in polled (step counter) mode.
        const PEDOMETER_STEP      = 0x010;
        const PED_STANDALONE      = 0x020;
        const SIX_AXIS_QUATERNION = 0x040;
        const PED_QUATERNION      = 0x080;
        const PED_INDICATOR       = 0x100;
        const BATCH_MODE          = 0x200;

        const DMP_FEATURES = Self::QUATERNION.bits()
            | Self::DISPL_ORIENTATION.bits()
            | Self::SIGNIFICANT_MOTION.bits()
            | Self::PEDOMETER.bits()
            | Self::PEDOMETER_STEP.bits()
            | Self::SIX_AXIS_QUATERNION.bits()
            | Self::PED_QUATERNION.bits()
            | Self::BATCH_MODE.bits();

        /// Mutually exclusive quaternion sources.
        const QUAT_SOURCES = Self::QUATERNION.bits()
            | Self::SIX_AXIS_QUATERNION.bits()
            | Self::PED_QUATERNION.bits()
            | Self::PED_STANDALONE.bits();
    }
}

/// Accuracy reported with each event.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Status {
    #[default]
    Unreliable = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

/// Payload of a [`SensorEvent`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventData {
    /// Calibrated 3-axis value (gyro, accel, mag, orientation, gravity, linear accel).
    Vector { values: [f32; 3], status: Status },
    /// Uncalibrated value with the bias that the calibrated stream subtracts.
    Uncalibrated { values: [f32; 3], bias: [f32; 3] },
    /// Rotation vector [x, y, z, w, heading accuracy].
    Rotation { values: [f32; 5], status: Status },
    /// Pressure in hPa.
    Pressure(f32),
    /// One-shot trigger (significant motion, step detector).
    Trigger,
    StepCount(u64),
}

impl EventData {
    pub fn status(&self) -> Status {
        match self {
            EventData::Vector { status, .. } | EventData::Rotation { status, .. } => *status,
            _ => Status::Unreliable,
        }
    }
}

/// One typed, timestamped sample delivered upward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorEvent {
    pub kind: SensorKind,
    /// Nanoseconds, device clock.
    pub timestamp: i64,
    pub data: EventData,
}

/// Output of [`crate::MotionHal::read_events`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    Sensor(SensorEvent),
    /// Meta event closing a `flush` request.
    FlushComplete(SensorKind),
}

impl Event {
    pub fn kind(&self) -> SensorKind {
        match self {
            Event::Sensor(ev) => ev.kind,
            Event::FlushComplete(kind) => *kind,
        }
    }
}
