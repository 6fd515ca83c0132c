//! Contract with the sensor fusion library, and its notification channel.
//!
//! The fusion library is opaque: the HAL feeds it raw samples, pushes rate
//! hints, and reads back per-kind outputs and biases. Bias and accuracy
//! changes are announced asynchronously as [`FusionMessage`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::protocol::QuatKind;
use crate::types::{Engine, SensorKind, Status};
use crate::{HalError, Result};

/// Capacity of the notification channel.
pub const NOTIFY_CAPACITY: usize = 64;

/// Per-output sample rate hints, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusionRate {
    Gyro,
    Accel,
    Compass,
    Quat,
    LinearAccel,
    Orientation,
    RotationVector,
    Gravity,
    GeomagOrientation,
    SixAxisRotationVector,
    GeomagRotationVector,
}

impl FusionRate {
    /// Rates of the virtual outputs, pushed together whenever fusion runs.
    pub const VIRTUAL: [FusionRate; 7] = [
        FusionRate::LinearAccel,
        FusionRate::Orientation,
        FusionRate::RotationVector,
        FusionRate::Gravity,
        FusionRate::GeomagOrientation,
        FusionRate::SixAxisRotationVector,
        FusionRate::GeomagRotationVector,
    ];
}

/// One fused output as read back for a sensor kind.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FusionOutput {
    pub values: [f32; 5],
    pub status: Status,
    pub timestamp: i64,
    /// Whether a new value was produced since the last read.
    pub updated: bool,
}

/// Asynchronous notices from the fusion library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMessage {
    /// The device is still; gyro bias is fully trusted.
    NoMotion,
    NewAccelBias,
    NewGyroBias,
    NewFactoryGyroBias,
    NewFactoryAccelBias,
    NewCompassBias,
}

/// The fusion library.
pub trait Fusion: Send {
    fn build_gyro(&mut self, raw: [i32; 3], timestamp: i64);
    fn build_accel(&mut self, raw: [i32; 3], timestamp: i64);
    fn build_compass(&mut self, raw: [i32; 3], timestamp: i64);
    fn build_quat(&mut self, kind: QuatKind, quat: [i32; 3], bias_applied: bool, timestamp: i64);
    fn build_pressure(&mut self, raw: i32, timestamp: i64);
    fn build_temp(&mut self, temperature: i64, timestamp: i64);

    fn set_rate(&mut self, rate: FusionRate, period_us: i64);

    /// Mounting orientation and full-scale sensitivity for a physical engine.
    fn set_orientation(&mut self, engine: Engine, matrix: [i8; 9], sensitivity: i64);

    fn output(&mut self, kind: SensorKind) -> FusionOutput;

    fn gyro_was_turned_off(&mut self);
    fn accel_was_turned_off(&mut self);
    fn compass_was_turned_off(&mut self);
    fn quaternion_was_turned_off(&mut self);

    fn load_calibration(&mut self) -> Result<()>;
    fn store_calibration(&mut self) -> Result<()>;

    /// Gyro bias in chip units scaled by 2^16, body frame.
    fn gyro_bias(&self) -> [i64; 3];
    /// Zero when unknown.
    fn gyro_sensitivity(&self) -> i64;
    fn gyro_bias_dmp_units(&self) -> [i64; 3];
    /// Accel bias in mg scaled by 2^16.
    fn accel_bias(&self) -> [i64; 3];
    fn accel_accuracy(&self) -> i32;
    fn compass_bias(&self) -> [i64; 3];
    /// Zero when unknown.
    fn compass_sensitivity(&self) -> i64;
    fn compass_accuracy(&self) -> i32;
    fn factory_gyro_bias(&self) -> [i64; 3];
    fn factory_accel_bias(&self) -> [i64; 3];
    fn six_axis_quaternion(&self) -> [i32; 4];
}

/// Sending side of the notification channel, handed to the fusion library.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: Sender<FusionMessage>,
    disconnected: Arc<AtomicBool>,
}

impl Notifier {
    /// Post a notice. A full channel drops it.
    ///
    /// Fails with [`HalError::ChannelDisconnected`] once the HAL side has gone
    /// away. The disconnect is logged by the first sender that sees it.
    pub fn notify(&self, msg: FusionMessage) -> Result<()> {
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::trace!("fusion channel full, dropping {:?}", msg);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                if !self.disconnected.swap(true, Ordering::Relaxed) {
                    log::warn!("fusion channel disconnected, dropping {:?}", msg);
                }
                Err(HalError::ChannelDisconnected)
            }
        }
    }
}

/// Receiving side, drained once per dispatch pass.
#[derive(Debug)]
pub(crate) struct Notifications {
    sender: Sender<FusionMessage>,
    receiver: Receiver<FusionMessage>,
    disconnected: Arc<AtomicBool>,
}

impl Notifications {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(NOTIFY_CAPACITY);
        Notifications {
            sender,
            receiver,
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            sender: self.sender.clone(),
            disconnected: Arc::clone(&self.disconnected),
        }
    }

    /// Everything queued right now, in arrival order.
    pub fn drain(&mut self) -> Vec<FusionMessage> {
        self.receiver.try_iter().collect()
    }
}
