//! DMP power and feature routines.
//!
//! At most one quaternion source (low-power, 6-axis, pedometer quaternion,
//! standalone pedometer) runs at a time: enabling one releases whichever other
//! source is active first.

use crate::engine::{hz, log_failure, MotionHal, STEP_COUNT_POLL_NS};
use crate::protocol::RATE_200HZ;
use crate::sysfs::Attr;
use crate::types::{Engine, EngineMask, Features, SensorKind, SensorMask};
use crate::{HalError, Result};

impl MotionHal {
    /// Load a DMP firmware image into the motion processor.
    pub fn load_dmp(&mut self, image: &[u8]) -> Result<()> {
        if image.is_empty() {
            return Err(HalError::InvalidArgument("empty DMP image".into()));
        }
        self.sysfs.write_bytes(Attr::DmpFirmware, image)?;
        self.dmp_loaded = true;
        log::info!("DMP image loaded ({} bytes)", image.len());
        Ok(())
    }

    pub fn dmp_loaded(&self) -> bool {
        self.dmp_loaded
    }

    /// Start or stop the DMP.
    pub(crate) fn on_dmp(&mut self, on: bool) -> Result<()> {
        self.dmp_on = on;
        if self.sysfs.read_int(Attr::FirmwareLoaded)? != 1 {
            return Err(HalError::DmpNotLoaded);
        }

        let running = self.sysfs.read_int(Attr::DmpOn)? != 0;
        if running == on {
            if !on {
                self.apply_accel_bias();
            }
            return Ok(());
        }

        let mut result = match self.write_attr(Attr::DmpOn, on as i64) {
            Ok(()) => {
                self.dmp_on = on;
                if !on {
                    self.apply_accel_bias();
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        let res = self.write_attr(Attr::DmpIntOn, on as i64);
        log_failure(res, "DMP interrupt");
        if !on {
            if let Err(e) = self.write_attr(Attr::DmpEventIntOn, 0) {
                result = Err(e);
            }
        }
        if self.config.log.process {
            log::debug!("DMP {}", if on { "on" } else { "off" });
        }
        result
    }

    /// Turn the DMP on when any feature or an eligible quaternion consumer needs it.
    pub(crate) fn compute_and_set_dmp_state(&mut self) -> Result<bool> {
        let quat_consumer = self
            .enabled
            .intersects(SensorMask::NINE_AXIS | SensorMask::GYRO_SIX_AXIS)
            && self.features.contains(Features::QUATERNION)
            && self.lpq_rate_supported();
        let state = !self.features.is_empty() || quat_consumer;

        self.on_dmp(state)?;
        if state {
            self.write_attr(Attr::SamplingFrequency, hz(RATE_200HZ))?;
        }
        Ok(state)
    }

    /// Power the engines a DMP feature needs, or release them.
    fn set_dmp_feature(&mut self, on: bool) -> Result<()> {
        let active = self.active();
        if on || self.features.intersects(Features::DMP_FEATURES) {
            if self.features.intersects(
                Features::SIX_AXIS_QUATERNION | Features::PED_QUATERNION | Features::QUATERNION,
            ) {
                self.enable_gyro(true)?;
                if !active.has(Engine::Gyro) {
                    self.turn_off_gyro_fifo()?;
                }
            }
            self.enable_accel(true)?;
            if !active.has(Engine::Accel) {
                self.turn_off_accel_fifo()?;
            }
        } else {
            if !active.has(Engine::Gyro) {
                self.enable_gyro(false)?;
            }
            if !active.has(Engine::Accel) {
                self.enable_accel(false)?;
            }
        }

        let data_interrupt = !self.enabled.is_empty() || self.features.contains(Features::BATCH_MODE);
        self.write_attr(Attr::DmpEventIntOn, (!data_interrupt) as i64)
    }

    pub(crate) fn turn_off_accel_fifo(&mut self) -> Result<()> {
        self.write_attr(Attr::AccelFifoEnable, 0)
    }

    pub(crate) fn turn_off_gyro_fifo(&mut self) -> Result<()> {
        self.write_attr(Attr::GyroFifoEnable, 0)
    }

    /// Drop the raw engines a quaternion source was keeping alive.
    fn release_raw_engines(&mut self) -> Result<()> {
        let active = self.active();
        if !self.features.intersects(Features::DMP_FEATURES) {
            if !active.has(Engine::Accel) {
                self.enable_accel(false)?;
            }
            if !active.has(Engine::Gyro) {
                self.enable_gyro(false)?;
            }
        }
        if self.features.contains(Features::QUATERNION) {
            self.write_attr(Attr::GyroFifoEnable, 1)?;
            self.write_attr(Attr::AccelFifoEnable, 1)?;
        }
        Ok(())
    }

    /// Put back the local engine bits a quaternion source had taken over.
    fn restore_local_mask(&mut self) {
        if self.enabled.has(SensorKind::GameRotationVector) {
            self.local |= EngineMask::GYRO | EngineMask::ACCEL;
        } else if self.enabled.has(SensorKind::Accelerometer) {
            self.local |= EngineMask::ACCEL;
        } else if self.enabled.intersects(SensorMask::GYRO | SensorMask::RAW_GYRO) {
            self.local |= EngineMask::GYRO;
        }
    }

    /// Release every running quaternion source except `keep`.
    fn release_quaternion_sources(&mut self, keep: Features) {
        let running = self.features & Features::QUAT_SOURCES & !keep;
        if running.contains(Features::QUATERNION) {
            let res = self.enable_lp_quaternion(false);
            log_failure(res, "release LP quaternion");
        }
        if running.contains(Features::SIX_AXIS_QUATERNION) {
            let res = self.enable_6axis_quaternion(false);
            log_failure(res, "release 6-axis quaternion");
        }
        if running.contains(Features::PED_QUATERNION) {
            let res = self.enable_ped_quaternion(false);
            log_failure(res, "release ped quaternion");
        }
        if running.contains(Features::PED_STANDALONE) {
            let res = self.enable_ped_standalone(false);
            log_failure(res, "release ped standalone");
        }
    }

    /// Clear `flag` and stop the DMP when nothing else needs it.
    fn drop_feature(&mut self, flag: Features) {
        self.features.remove(flag);
        if self.features.is_empty() {
            let res = self.on_dmp(false);
            log_failure(res, "DMP off");
        }
    }

    // -- low-power quaternion --

    pub(crate) fn enable_quaternion_data(&mut self, on: bool) -> Result<()> {
        self.write_attr(Attr::ThreeAxesQOn, on as i64)?;
        if !on {
            self.fusion.quaternion_was_turned_off();
        }
        Ok(())
    }

    pub(crate) fn enable_lp_quaternion(&mut self, on: bool) -> Result<()> {
        if !on {
            if !self.features.contains(Features::QUATERNION) {
                return Ok(());
            }
            let res = self.enable_quaternion_data(false);
            log_failure(res, "LP quaternion data");
            self.drop_feature(Features::QUATERNION);
            return Ok(());
        }

        self.release_quaternion_sources(Features::QUATERNION);
        self.enable_quaternion_data(true)
            .and_then(|()| self.on_dmp(true))?;
        self.features.insert(Features::QUATERNION);
        if self.config.log.process {
            log::debug!("LP quaternion on");
        }
        Ok(())
    }

    // -- 6-axis quaternion --

    fn enable_6axis_quaternion_data(&mut self, on: bool) -> Result<()> {
        self.write_attr(Attr::SixAxesQOn, on as i64)?;

        if !on {
            self.fusion.quaternion_was_turned_off();
            self.release_raw_engines()?;
            if self.enabled.has(SensorKind::GameRotationVector)
                && !self.features.contains(Features::PED_QUATERNION)
            {
                self.local |= EngineMask::GYRO | EngineMask::ACCEL;
                self.write_attr(Attr::GyroFifoEnable, 1)?;
                self.write_attr(Attr::AccelFifoEnable, 1)?;
            } else {
                self.restore_local_mask();
            }
            return Ok(());
        }

        if !self.enabled.has(SensorKind::GameRotationVector) {
            return Ok(());
        }
        self.enable_accel(true)?;
        self.enable_gyro(true)?;

        let active = self.active();
        let batch = self.batch_enabled;
        let enabled = self.enabled;
        if !active.has(Engine::Accel)
            || !batch.has(SensorKind::Accelerometer)
            || !enabled.has(SensorKind::Accelerometer)
        {
            self.turn_off_accel_fifo()?;
        }
        let gyro_feeds = |k: SensorKind| batch.has(k) && enabled.has(k);
        if (!active.has(Engine::Gyro) || !gyro_feeds(SensorKind::Gyro))
            && !gyro_feeds(SensorKind::RawGyro)
        {
            self.turn_off_gyro_fifo()?;
        }
        Ok(())
    }

    pub(crate) fn enable_6axis_quaternion(&mut self, on: bool) -> Result<()> {
        if !on {
            if !self.features.contains(Features::SIX_AXIS_QUATERNION) {
                return Ok(());
            }
            let res = self.enable_6axis_quaternion_data(false);
            log_failure(res, "6-axis quaternion data");
            self.drop_feature(Features::SIX_AXIS_QUATERNION);
            return Ok(());
        }

        self.release_quaternion_sources(Features::SIX_AXIS_QUATERNION);
        self.enable_6axis_quaternion_data(true)
            .and_then(|()| self.on_dmp(true))?;
        self.features.insert(Features::SIX_AXIS_QUATERNION);
        Ok(())
    }

    /// Seed the 6-axis engine with the last fused orientation.
    pub(crate) fn set_initial_6quat(&mut self) {
        let Some(quat) = self.initial_6quat else {
            return;
        };
        let bytes: Vec<u8> = quat.iter().flat_map(|q| q.to_be_bytes()).collect();
        match self.sysfs.write_bytes(Attr::SixAxesQValue, &bytes) {
            Ok(()) => self.initial_6quat = None,
            Err(e) => log::error!("Cannot write initial 6-axis quaternion: {}", e),
        }
    }

    // -- pedometer quaternion --

    fn enable_ped_quaternion_data(&mut self, on: bool) -> Result<()> {
        self.write_attr(Attr::PedQOn, on as i64)?;

        if !on {
            self.release_raw_engines()?;
            self.restore_local_mask();
            return Ok(());
        }

        self.enable_accel(true)?;
        self.enable_gyro(true)?;
        let active = self.active();
        let batch = self.batch_enabled;
        if !active.has(Engine::Accel) || !batch.has(SensorKind::Accelerometer) {
            self.turn_off_accel_fifo()?;
            self.local.remove(EngineMask::ACCEL);
        }
        if !active.has(Engine::Gyro) || !batch.intersects(SensorMask::GYRO | SensorMask::RAW_GYRO) {
            self.turn_off_gyro_fifo()?;
            self.local.remove(EngineMask::GYRO);
        }
        Ok(())
    }

    pub(crate) fn enable_ped_quaternion(&mut self, on: bool) -> Result<()> {
        if !on {
            if !self.features.contains(Features::PED_QUATERNION) {
                return Ok(());
            }
            let res = self.enable_ped_quaternion_data(false);
            log_failure(res, "ped quaternion data");
            self.drop_feature(Features::PED_QUATERNION);
            return self.restore_pedometer_interrupt();
        }

        self.release_quaternion_sources(Features::PED_QUATERNION);
        self.enable_ped_quaternion_data(true)
            .and_then(|()| self.on_dmp(true))?;
        self.features.insert(Features::PED_QUATERNION);
        self.write_attr(Attr::PedometerIntOn, 0)?;
        self.write_attr(Attr::DmpEventIntOn, 0)
    }

    // -- standalone pedometer --

    fn enable_ped_standalone_data(&mut self, on: bool) -> Result<()> {
        let mut result = self.write_attr(Attr::StepDetectorOn, on as i64);
        if let Err(e) = self.write_attr(Attr::StepIndicatorOn, on as i64) {
            result = Err(e);
        }

        let active = self.active();
        if !on {
            if !self.features.intersects(Features::DMP_FEATURES) {
                if !active.has(Engine::Accel) {
                    self.enable_accel(false)?;
                }
                if !active.has(Engine::Gyro) {
                    self.enable_gyro(false)?;
                }
            }
            return result;
        }

        self.enable_accel(true)?;
        if !active.has(Engine::Accel) {
            self.turn_off_accel_fifo()?;
        }
        result
    }

    pub(crate) fn enable_ped_standalone(&mut self, on: bool) -> Result<()> {
        if !on {
            if !self.features.contains(Features::PED_STANDALONE) {
                return Ok(());
            }
            let res = self.enable_ped_standalone_data(false);
            log_failure(res, "ped standalone data");
            self.drop_feature(Features::PED_STANDALONE);
            return self.restore_pedometer_interrupt();
        }

        self.release_quaternion_sources(Features::PED_STANDALONE);
        self.enable_ped_standalone_data(true)
            .and_then(|()| self.on_dmp(true))?;
        self.features.insert(Features::PED_STANDALONE);
        self.write_attr(Attr::PedometerIntOn, 0)?;
        self.write_attr(Attr::DmpEventIntOn, 0)
    }

    /// Hand step reporting back to the pedometer interrupt.
    fn restore_pedometer_interrupt(&mut self) -> Result<()> {
        if !self.features.contains(Features::PEDOMETER) {
            return Ok(());
        }
        self.write_attr(Attr::PedometerIntOn, 1)?;
        if self.enabled.is_empty() {
            self.write_attr(Attr::DmpEventIntOn, 1)?;
        }
        Ok(())
    }

    pub(crate) fn enable_ped_indicator(&mut self, on: bool) -> Result<()> {
        if on && !self.features.contains(Features::PED_QUATERNION) {
            self.write_attr(Attr::PedometerIntOn, 0)?;
        }
        self.write_attr(Attr::StepIndicatorOn, on as i64)
    }

    // -- pedometer and significant motion --

    /// Run the pedometer for the step detector (`interrupt`) or the step counter.
    pub(crate) fn enable_dmp_pedometer(&mut self, on: bool, interrupt: bool) -> Result<()> {
        let flag = if interrupt {
            Features::PEDOMETER
        } else {
            Features::PEDOMETER_STEP
        };

        if on {
            self.write_attr(Attr::PedometerOn, 1)?;
            if interrupt || self.features.contains(Features::PEDOMETER) {
                self.write_attr(Attr::PedometerIntOn, 1)?;
            }
            self.features.insert(flag);
            if !interrupt {
                self.step_poll_ns = Some(STEP_COUNT_POLL_NS);
                self.last_step_poll = std::time::Instant::now();
            }
        } else {
            self.features.remove(flag);
            if !interrupt {
                self.step_poll_ns = None;
            }
            if !self
                .features
                .intersects(Features::PEDOMETER | Features::PEDOMETER_STEP)
            {
                self.write_attr(Attr::PedometerOn, 0)?;
            }
            if !self.features.contains(Features::PEDOMETER) {
                self.write_attr(Attr::PedometerIntOn, 0)?;
            }
        }

        self.set_dmp_feature(on)?;
        self.compute_and_set_dmp_state()?;
        let res = self.reset_data_rates();
        log_failure(res, "reset data rates");
        if self.config.log.process {
            log::debug!(
                "pedometer {} {}",
                if interrupt { "interrupt" } else { "counter" },
                if on { "on" } else { "off" }
            );
        }
        Ok(())
    }

    pub(crate) fn enable_dmp_significant_motion(&mut self, on: bool) -> Result<()> {
        let write = self.write_attr(Attr::SmdEnable, on as i64);
        if on {
            write?;
        } else {
            log_failure(write, "significant motion off");
        }
        self.features.set(Features::SIGNIFICANT_MOTION, on);
        self.set_dmp_feature(on)?;
        self.compute_and_set_dmp_state()?;
        Ok(())
    }
}
