//! Bias bookkeeping and its application to the hardware.
//!
//! Factory biases become per-axis chip offsets; in-use biases learned by the
//! fusion library are written to the DMP bias attributes. Each vector is
//! applied at most once per update.

use std::f32::consts::PI;

use crate::adapter::PhysicalSensor;
use crate::sysfs::{Attr, SysfsAttrs};
use crate::Result;

pub const DEFAULT_GYRO_SCALE: i64 = 2000;
pub const GYRO_SELF_TEST_SCALE: i64 = 250;
pub const DEFAULT_ACCEL_SCALE: i64 = 2;

/// Chip offset register units per bias unit.
const GYRO_OFFSET_SCALE: f32 = 4.0;
const ACCEL_OFFSET_SCALE: f32 = 16.0;

/// Q16 fixed point.
const Q16: f32 = 65536.0;
/// Q30 fixed point.
const Q30: f32 = (1u64 << 30) as f32;

/// One 3-axis bias with its apply state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BiasVector<T> {
    pub values: [T; 3],
    /// A new value is waiting to be written.
    pub available: bool,
    pub applied: bool,
}

impl<T: Copy> BiasVector<T> {
    pub fn update(&mut self, values: [T; 3]) {
        self.values = values;
        self.available = true;
    }
}

/// All bias vectors the HAL tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BiasState {
    /// From the calibration file, Q16.
    pub factory_gyro: BiasVector<i64>,
    pub factory_accel: BiasVector<i64>,
    /// In-use gyro bias in rad/s, reported with uncalibrated gyro.
    pub gyro: BiasVector<f32>,
    /// In-use accel bias in mg, Q16.
    pub accel: BiasVector<i64>,
    /// In-use compass bias in uT, reported with uncalibrated compass.
    pub compass: BiasVector<f32>,
}

/// Full-scale settings used to convert biases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scales {
    /// Degrees per second.
    pub gyro: i64,
    pub gyro_self_test: i64,
    /// g.
    pub accel: i64,
    pub accel_self_test: i64,
    /// Compass sensitivity, Q30.
    pub compass: i64,
}

impl Default for Scales {
    fn default() -> Self {
        Scales {
            gyro: DEFAULT_GYRO_SCALE,
            gyro_self_test: GYRO_SELF_TEST_SCALE,
            accel: DEFAULT_ACCEL_SCALE,
            accel_self_test: accel_self_test_scale(""),
            compass: 0,
        }
    }
}

impl Scales {
    /// Derive scales from the chip name and the attached engines.
    pub fn derive(
        chip: &str,
        gyro: Option<&dyn PhysicalSensor>,
        accel: Option<&dyn PhysicalSensor>,
        compass: Option<&dyn PhysicalSensor>,
    ) -> Scales {
        let mut scales = Scales {
            accel_self_test: accel_self_test_scale(chip),
            ..Scales::default()
        };
        if let Some(gyro) = gyro {
            scales.gyro = gyro_scale_from_peak(gyro.peak_raw());
        }
        if let Some(accel) = accel {
            if accel.descriptor().version > 2 {
                scales.accel = accel_scale_from_peak(accel.peak_raw());
            }
        }
        if let Some(compass) = compass {
            scales.compass = (compass.scale() * Q30 as f64) as i64;
        }
        scales
    }
}

pub fn gyro_scale_from_peak(peak: f32) -> i64 {
    match peak {
        p if p > 30.0 => 2000,
        p if p > 15.0 => 1000,
        p if p > 7.0 => 500,
        p if p > 3.0 => 250,
        _ => DEFAULT_GYRO_SCALE,
    }
}

pub fn accel_scale_from_peak(peak: f32) -> i64 {
    match peak {
        p if p > 120.0 => 16,
        p if p > 60.0 => 8,
        p if p > 30.0 => 4,
        p if p > 15.0 => 2,
        _ => DEFAULT_ACCEL_SCALE,
    }
}

pub fn accel_self_test_scale(chip: &str) -> i64 {
    if chip == "mpu6050" {
        8
    } else {
        2
    }
}

/// Body-frame gyro bias (Q16 chip units) to rad/s.
pub fn gyro_bias_to_rad(bias: [i64; 3], sensitivity: i64, scales: &Scales) -> [f32; 3] {
    let sens = if sensitivity == 0 { scales.gyro } else { sensitivity };
    let per_unit = sens as f32 / Q30;
    bias.map(|b| b as f32 * per_unit / Q16 / 180.0 * PI)
}

/// Body-frame compass bias (Q16 chip units) to uT.
pub fn compass_bias_to_ut(bias: [i64; 3], sensitivity: i64, scales: &Scales) -> [f32; 3] {
    let sens = if sensitivity == 0 { scales.compass } else { sensitivity };
    let per_unit = sens as f32 / Q30;
    bias.map(|b| b as f32 * per_unit / Q16)
}

/// Factory gyro bias to a chip offset.
pub fn factory_gyro_offset(bias: i64, scales: &Scales) -> f32 {
    let ratio = (scales.gyro / scales.gyro_self_test.max(1)) as f32;
    bias as f32 / Q16 * ratio * -1.0 / GYRO_OFFSET_SCALE
}

/// Factory accel bias to a chip offset.
pub fn factory_accel_offset(bias: i64, scales: &Scales) -> f32 {
    let ratio = (scales.accel / scales.accel_self_test.max(1)) as f32;
    -(bias as f32) / Q16 * ratio / ACCEL_OFFSET_SCALE
}

/// Accel bias as the DMP expects it.
pub fn accel_dmp_bias(bias: i64) -> i64 {
    (bias as f32 / Q16 / 2.0) as i64
}

/// Write the in-use gyro bias, already in DMP units, to the DMP.
pub fn apply_gyro_bias(
    state: &mut BiasState,
    sysfs: &mut dyn SysfsAttrs,
    dmp_units: [i64; 3],
) -> Result<()> {
    if !state.gyro.available {
        return Ok(());
    }
    for (attr, value) in Attr::GYRO_DMP_BIAS.into_iter().zip(dmp_units) {
        sysfs.write_int(attr, value)?;
    }
    state.gyro.applied = true;
    state.gyro.available = false;
    log::debug!("gyro DMP bias applied {:?}", dmp_units);
    Ok(())
}

pub fn apply_accel_bias(state: &mut BiasState, sysfs: &mut dyn SysfsAttrs) -> Result<()> {
    if !state.accel.available {
        return Ok(());
    }
    for (attr, bias) in Attr::ACCEL_DMP_BIAS.into_iter().zip(state.accel.values) {
        sysfs.write_int(attr, accel_dmp_bias(bias))?;
    }
    state.accel.available = false;
    state.accel.applied = true;
    log::debug!("accel DMP bias applied {:?}", state.accel.values);
    Ok(())
}

pub fn apply_factory_gyro_bias(
    state: &mut BiasState,
    gyro: &mut dyn PhysicalSensor,
    scales: &Scales,
) -> Result<()> {
    if !state.factory_gyro.available {
        return Ok(());
    }
    for (axis, bias) in state.factory_gyro.values.into_iter().enumerate() {
        gyro.set_offset(axis, factory_gyro_offset(bias, scales))?;
    }
    state.factory_gyro.available = false;
    state.factory_gyro.applied = true;
    Ok(())
}

pub fn apply_factory_accel_bias(
    state: &mut BiasState,
    accel: &mut dyn PhysicalSensor,
    scales: &Scales,
) -> Result<()> {
    if !state.factory_accel.available {
        return Ok(());
    }
    for (axis, bias) in state.factory_accel.values.into_iter().enumerate() {
        accel.set_offset(axis, factory_accel_offset(bias, scales))?;
    }
    state.factory_accel.available = false;
    state.factory_accel.applied = true;
    Ok(())
}

/// Zero the DMP biases and the chip offsets.
pub fn init_bias(
    sysfs: &mut dyn SysfsAttrs,
    gyro: Option<&mut (dyn PhysicalSensor + 'static)>,
    accel: Option<&mut (dyn PhysicalSensor + 'static)>,
) -> Result<()> {
    for attr in Attr::ACCEL_DMP_BIAS {
        sysfs.write_int(attr, 0)?;
    }
    if let Some(accel) = accel {
        for axis in 0..3 {
            accel.set_offset(axis, 0.0)?;
        }
    }
    for attr in Attr::GYRO_DMP_BIAS {
        sysfs.write_int(attr, 0)?;
    }
    if let Some(gyro) = gyro {
        for axis in 0..3 {
            gyro.set_offset(axis, 0.0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSensor, MemSysfs};
    use crate::types::Engine;

    #[test]
    fn test_scale_tables() {
        assert_eq!(gyro_scale_from_peak(34.9), 2000);
        assert_eq!(gyro_scale_from_peak(17.5), 1000);
        assert_eq!(gyro_scale_from_peak(8.7), 500);
        assert_eq!(gyro_scale_from_peak(4.4), 250);
        assert_eq!(gyro_scale_from_peak(1.0), 2000);
        assert_eq!(accel_scale_from_peak(156.9), 16);
        assert_eq!(accel_scale_from_peak(78.4), 8);
        assert_eq!(accel_scale_from_peak(39.2), 4);
        assert_eq!(accel_scale_from_peak(19.6), 2);
        assert_eq!(accel_scale_from_peak(5.0), 2);
        assert_eq!(accel_self_test_scale("mpu6050"), 8);
        assert_eq!(accel_self_test_scale("mpu6515"), 2);
    }

    #[test]
    fn test_factory_offsets() {
        let scales = Scales::default();
        // ratio 2000 / 250 = 8
        assert_eq!(factory_gyro_offset(65536 * 2, &scales), -4.0);
        let scales = Scales { accel: 16, accel_self_test: 2, ..Scales::default() };
        // ratio 8, / 16
        assert_eq!(factory_accel_offset(65536 * 4, &scales), -2.0);
        assert_eq!(accel_dmp_bias(65536 * 10), 5);
    }

    #[test]
    fn test_apply_gyro_bias_once() {
        let (mut sysfs, log) = MemSysfs::new();
        let mut state = BiasState::default();

        apply_gyro_bias(&mut state, &mut sysfs, [1, 2, 3]).unwrap();
        assert!(log.writes().is_empty());

        state.gyro.update([0.1, 0.2, 0.3]);
        apply_gyro_bias(&mut state, &mut sysfs, [1, 2, 3]).unwrap();
        assert_eq!(
            log.writes(),
            vec![(Attr::GyroXDmpBias, 1), (Attr::GyroYDmpBias, 2), (Attr::GyroZDmpBias, 3)]
        );
        assert!(state.gyro.applied && !state.gyro.available);

        apply_gyro_bias(&mut state, &mut sysfs, [1, 2, 3]).unwrap();
        assert_eq!(log.writes().len(), 3);
    }

    #[test]
    fn test_failed_write_keeps_bias_available() {
        let (mut sysfs, log) = MemSysfs::new();
        log.fail_on(Attr::AccelYDmpBias);
        let mut state = BiasState::default();
        state.accel.update([65536 * 2, 0, 0]);
        assert!(apply_accel_bias(&mut state, &mut sysfs).is_err());
        assert!(state.accel.available);
        assert!(!state.accel.applied);
        assert_eq!(log.writes(), vec![(Attr::AccelXDmpBias, 1)]);
    }

    #[test]
    fn test_factory_gyro_bias_goes_to_offsets() {
        let (mut gyro, probe) = FakeSensor::new(Engine::Gyro);
        let mut state = BiasState::default();
        state.factory_gyro.update([65536, 0, -65536]);
        apply_factory_gyro_bias(&mut state, &mut gyro, &Scales::default()).unwrap();
        assert_eq!(probe.offsets(), vec![(0, -2.0), (1, 0.0), (2, 2.0)]);
        assert!(state.factory_gyro.applied);
    }

    #[test]
    fn test_bias_conversions() {
        let scales = Scales { compass: 1 << 30, ..Scales::default() };
        let ut = compass_bias_to_ut([65536 * 3, 0, 0], 0, &scales);
        assert!((ut[0] - 3.0).abs() < 1e-6);

        // sensitivity of 180 << 30 makes one Q16 unit exactly pi rad/s
        let rad = gyro_bias_to_rad([65536, 0, 0], 180 << 30, &scales);
        assert!((rad[0] - PI).abs() < 1e-5);
    }
}
