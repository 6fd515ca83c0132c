//! IIO sysfs attribute access.
//!
//! The motion processor is configured through a fixed set of attribute files
//! under one IIO device directory. [`Attr`] names every file the HAL touches;
//! [`SysfsAttrs`] is the seam tests replace with an in-memory map.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{HalError, Result};

/// Every sysfs attribute the HAL reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attr {
    /// Chip name.
    Part,
    SmdThreshold,
    DmpFirmware,
    FirmwareLoaded,
    DmpOn,
    DmpIntOn,
    DmpEventIntOn,
    /// FIFO output rate in Hz. This is also the accel FIFO rate.
    SamplingFrequency,
    ThreeAxesQOn,
    ThreeAxesQRate,
    SixAxesQOn,
    SixAxesQRate,
    SixAxesQValue,
    PedQOn,
    PedQRate,
    StepDetectorOn,
    StepIndicatorOn,
    PedometerOn,
    PedometerIntOn,
    PedometerSteps,
    PedometerCounter,
    SmdEnable,
    EventSmd,
    BatchmodeTimeout,
    GyroFifoEnable,
    AccelFifoEnable,
    AccelXDmpBias,
    AccelYDmpBias,
    AccelZDmpBias,
    GyroXDmpBias,
    GyroYDmpBias,
    GyroZDmpBias,
}

impl Attr {
    pub const ACCEL_DMP_BIAS: [Attr; 3] = [Attr::AccelXDmpBias, Attr::AccelYDmpBias, Attr::AccelZDmpBias];
    pub const GYRO_DMP_BIAS: [Attr; 3] = [Attr::GyroXDmpBias, Attr::GyroYDmpBias, Attr::GyroZDmpBias];

    /// File name relative to the IIO device directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Attr::Part => "part",
            Attr::SmdThreshold => "smd_threshold",
            Attr::DmpFirmware => "dmp_firmware",
            Attr::FirmwareLoaded => "firmware_loaded",
            Attr::DmpOn => "dmp_on",
            Attr::DmpIntOn => "dmp_int_on",
            Attr::DmpEventIntOn => "dmp_event_int_on",
            Attr::SamplingFrequency => "sampling_frequency",
            Attr::ThreeAxesQOn => "three_axes_q_on",
            Attr::ThreeAxesQRate => "three_axes_q_rate",
            Attr::SixAxesQOn => "six_axes_q_on",
            Attr::SixAxesQRate => "six_axes_q_rate",
            Attr::SixAxesQValue => "six_axes_q_value",
            Attr::PedQOn => "ped_q_on",
            Attr::PedQRate => "ped_q_rate",
            Attr::StepDetectorOn => "step_detector_on",
            Attr::StepIndicatorOn => "step_indicator_on",
            Attr::PedometerOn => "pedometer_on",
            Attr::PedometerIntOn => "pedometer_int_on",
            Attr::PedometerSteps => "pedometer_steps",
            Attr::PedometerCounter => "pedometer_counter",
            Attr::SmdEnable => "smd_enable",
            Attr::EventSmd => "event_smd",
            Attr::BatchmodeTimeout => "batchmode_timeout",
            Attr::GyroFifoEnable => "gyro_fifo_enable",
            Attr::AccelFifoEnable => "accel_fifo_enable",
            Attr::AccelXDmpBias => "in_accel_x_dmp_bias",
            Attr::AccelYDmpBias => "in_accel_y_dmp_bias",
            Attr::AccelZDmpBias => "in_accel_z_dmp_bias",
            Attr::GyroXDmpBias => "in_anglvel_x_dmp_bias",
            Attr::GyroYDmpBias => "in_anglvel_y_dmp_bias",
            Attr::GyroZDmpBias => "in_anglvel_z_dmp_bias",
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Access to the motion processor's attribute files.
pub trait SysfsAttrs: Send {
    fn read_int(&mut self, attr: Attr) -> Result<i64>;

    fn read_string(&mut self, attr: Attr) -> Result<String>;

    fn write_int(&mut self, attr: Attr, value: i64) -> Result<()>;

    fn write_bytes(&mut self, attr: Attr, bytes: &[u8]) -> Result<()>;
}

/// [`SysfsAttrs`] over a real IIO device directory.
#[derive(Debug, Clone)]
pub struct IioSysfs {
    root: PathBuf,
}

impl IioSysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        IioSysfs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, attr: Attr) -> PathBuf {
        self.root.join(attr.file_name())
    }
}

fn io_err(attr: Attr) -> impl FnOnce(std::io::Error) -> HalError {
    move |source| HalError::Io { attr, source }
}

impl SysfsAttrs for IioSysfs {
    fn read_int(&mut self, attr: Attr) -> Result<i64> {
        let text = self.read_string(attr)?;
        text.parse::<i64>()
            .map_err(|e| HalError::Sysfs(format!("{}: cannot parse {:?}: {}", attr, text, e)))
    }

    fn read_string(&mut self, attr: Attr) -> Result<String> {
        let text = fs::read_to_string(self.path(attr)).map_err(io_err(attr))?;
        Ok(text.trim().to_string())
    }

    fn write_int(&mut self, attr: Attr, value: i64) -> Result<()> {
        fs::write(self.path(attr), value.to_string()).map_err(io_err(attr))
    }

    fn write_bytes(&mut self, attr: Attr, bytes: &[u8]) -> Result<()> {
        fs::write(self.path(attr), bytes).map_err(io_err(attr))
    }
}
