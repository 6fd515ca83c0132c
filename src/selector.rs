//! Feature and mode selection.
//!
//! Pure decision functions over the enable/batch masks and the active DMP
//! features. The engine applies their results to hardware.

use crate::types::{EngineMask, Features, SensorKind, SensorMask};

/// Timeout recorded for a kind that is not batching.
pub const NO_BATCH_TIMEOUT: i64 = 100_000_000_000;

const PHYSICAL: [SensorKind; 6] = [
    SensorKind::Gyro,
    SensorKind::RawGyro,
    SensorKind::Accelerometer,
    SensorKind::MagneticField,
    SensorKind::RawMagneticField,
    SensorKind::Pressure,
];

/// Which quaternion source the DMP should be producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuatSource {
    PedQuat,
    SixAxis,
    LowPower,
    None,
}

/// Outcome of [`select_features`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Active features with BATCH_MODE set or cleared.
    pub features: Features,
    pub batch_mode: bool,
    /// Batch data output for the current batch mask.
    pub output: Features,
}

/// Whether every active consumer is batched, so the FIFO can run in batch mode.
pub fn compute_batch_sensor_mask(enabled: SensorMask, batch: SensorMask, features: Features) -> bool {
    if enabled.is_empty() && batch.is_empty() {
        return false;
    }

    let grv = SensorMask::GAME_ROTATION_VECTOR;
    let grv_unbatched = enabled.contains(grv) && !batch.contains(grv);
    for kind in PHYSICAL {
        if !enabled.has(kind) {
            continue;
        }
        if !batch.has(kind) {
            return false;
        }
        if grv_unbatched {
            return false;
        }
    }

    let virtuals = (SensorKind::Orientation.index()..=SensorKind::GeomagneticRotationVector.index())
        .filter_map(SensorKind::from_index);
    for kind in virtuals {
        if enabled.has(kind) && !batch.has(kind) {
            return false;
        }
    }

    if features.contains(Features::PEDOMETER) && !batch.contains(SensorMask::STEP_DETECTOR) {
        return false;
    }

    true
}

/// DMP data output for a batch mask.
pub fn compute_batch_data_output(batch: SensorMask) -> Features {
    if batch.is_empty() {
        return Features::empty();
    }

    let hardware = batch.intersects(SensorMask::HARDWARE);
    let grv = batch.contains(SensorMask::GAME_ROTATION_VECTOR);

    if batch.contains(SensorMask::STEP_DETECTOR) {
        return match (grv, hardware) {
            (true, true) => Features::SIX_AXIS_QUATERNION | Features::PED_INDICATOR,
            (true, false) => Features::PED_QUATERNION | Features::PED_INDICATOR,
            (false, true) => Features::PED_INDICATOR,
            (false, false) => Features::PED_STANDALONE | Features::PED_INDICATOR,
        };
    }
    if grv {
        return Features::SIX_AXIS_QUATERNION;
    }
    Features::empty()
}

/// Engine groups that must feed the FIFO for the enabled kinds.
///
/// Bits not decided by the first matching rule are carried over from `prev`.
pub fn compute_local_sensor_mask(
    prev: EngineMask,
    enabled: SensorMask,
    batch: SensorMask,
    features: Features,
) -> EngineMask {
    let mut mask = prev;
    let on = |k: SensorKind| enabled.has(k);
    let gyro = on(SensorKind::Gyro) || on(SensorKind::RawGyro);
    let accel = on(SensorKind::Accelerometer);
    let compass = on(SensorKind::MagneticField) || on(SensorKind::RawMagneticField);
    let grv = on(SensorKind::GameRotationVector);
    let gmrv = on(SensorKind::GeomagneticRotationVector);

    mask.set(EngineMask::PRESSURE, on(SensorKind::Pressure));

    if enabled.intersects(SensorMask::NINE_AXIS) || (grv && gmrv) {
        return mask | EngineMask::FUSION;
    }

    if grv {
        if !features.contains(Features::BATCH_MODE) || !batch.has(SensorKind::GameRotationVector) {
            mask |= EngineMask::GYRO | EngineMask::ACCEL;
        } else {
            mask.set(EngineMask::GYRO, gyro);
            mask.set(EngineMask::ACCEL, accel);
        }
        mask.set(EngineMask::COMPASS, compass);
        return mask;
    }

    if gmrv {
        mask |= EngineMask::ACCEL | EngineMask::COMPASS;
        mask.set(EngineMask::GYRO, gyro);
        return mask;
    }

    if !accel && !compass && !gyro && !on(SensorKind::Pressure) {
        return EngineMask::empty();
    }

    mask.set(EngineMask::GYRO, gyro);
    mask.set(EngineMask::ACCEL, accel);
    mask.set(EngineMask::COMPASS, compass);
    mask
}

/// Quaternion source for the current batch output.
///
/// `output` is the batch data output, `features` the active feature mask.
pub fn select_quaternion(
    output: Features,
    features: Features,
    batch_mode: bool,
    enabled: SensorMask,
) -> QuatSource {
    let grv = enabled.contains(SensorMask::GAME_ROTATION_VECTOR);
    if !grv {
        return QuatSource::None;
    }
    if !batch_mode {
        return QuatSource::LowPower;
    }
    if output.contains(Features::PED_QUATERNION) && features.contains(Features::PEDOMETER) {
        return QuatSource::PedQuat;
    }
    if output.contains(Features::SIX_AXIS_QUATERNION) {
        return QuatSource::SixAxis;
    }
    QuatSource::None
}

/// Batch mode and batch data output for the given masks.
pub fn select_features(enabled: SensorMask, batch: SensorMask, features: Features) -> Selection {
    let batch_mode = compute_batch_sensor_mask(enabled, batch, features);
    let mut features = features;
    features.set(Features::BATCH_MODE, batch_mode);
    Selection {
        features,
        batch_mode,
        output: compute_batch_data_output(batch),
    }
}

/// Smallest batch timeout among batching consumers.
///
/// A standalone pedometer output with the step detector batched opens the
/// search to every kind.
pub fn min_batch_timeout(
    enabled: SensorMask,
    batch: SensorMask,
    output: Features,
    timeouts: &[i64; SensorKind::COUNT],
) -> Option<i64> {
    let standalone =
        output.contains(Features::PED_STANDALONE) && batch.contains(SensorMask::STEP_DETECTOR);
    SensorKind::ALL
        .into_iter()
        .filter(|k| standalone || (enabled.has(*k) && batch.has(*k)))
        .map(|k| timeouts[k.index()])
        .min()
        .map(|t| t.min(NO_BATCH_TIMEOUT))
}
