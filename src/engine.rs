//! Sensor enable, rate and batch state machine.
//!
//! [`MotionHal`] owns every mask and delay table. Enable and batch requests
//! recompute the local engine mask, consult [`crate::selector`] and then issue
//! ordered adapter and sysfs calls. Adapter rate pushes are logged and not
//! propagated; every other failure aborts the call without rolling back the
//! steps already taken.

use std::time::Instant;

use crate::adapter::Engines;
use crate::calibration::{self, BiasState, Scales};
use crate::config::HalConfig;
use crate::dispatch::FlushState;
use crate::fusion::{Fusion, FusionRate, Notifications, Notifier};
use crate::protocol::{Decoder, RATE_200HZ};
use crate::selector::{
    compute_batch_data_output, compute_local_sensor_mask, min_batch_timeout, select_features,
    select_quaternion, QuatSource, NO_BATCH_TIMEOUT,
};
use crate::sysfs::{Attr, IioSysfs, SysfsAttrs};
use crate::types::{Engine, EngineMask, Features, SensorKind, SensorMask};
use crate::{HalError, Result};

// -- batch flags --

/// Validate the request without touching hardware.
pub const BATCH_DRY_RUN: i32 = 0x01;
/// Not supported.
pub const BATCH_WAKE_UPON_FIFO_FULL: i32 = 0x02;

// -- defaults --

pub const DEFAULT_DELAY_NS: i64 = 1_000_000_000;
/// Rate the fusion library starts with for gyro and compass, in microseconds.
pub const DEFAULT_MPL_RATE_US: i64 = 20_000;
/// Step counter poll interval once the counter is enabled.
pub const STEP_COUNT_POLL_NS: i64 = 100_000_000;

const HARDWARE_CHANGE: SensorMask = SensorMask::GYRO
    .union(SensorMask::RAW_GYRO)
    .union(SensorMask::ACCEL)
    .union(SensorMask::MAGNETIC_FIELD)
    .union(SensorMask::RAW_MAGNETIC_FIELD);

/// What a [`MotionHal::batch`] call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Forwarded to the physical engine's own batching.
    Delegated(Engine),
    /// No DMP image is loaded, so DMP batching is unavailable.
    NoDmp,
    DryRun,
    Applied { batch_mode: bool },
}

/// Physical engine behind a hardware kind.
pub fn engine_of(kind: SensorKind) -> Option<Engine> {
    match kind {
        SensorKind::Gyro | SensorKind::RawGyro => Some(Engine::Gyro),
        SensorKind::Accelerometer => Some(Engine::Accel),
        SensorKind::MagneticField | SensorKind::RawMagneticField => Some(Engine::Compass),
        SensorKind::Pressure => Some(Engine::Pressure),
        _ => None,
    }
}

pub(crate) fn hz(period_ns: i64) -> i64 {
    1_000_000_000 / period_ns.max(1)
}

/// Period for an engine fed by two kinds: the faster one that is in `mask`.
fn pair_delay(table: &[i64; SensorKind::COUNT], mask: SensorMask, a: SensorKind, b: SensorKind) -> i64 {
    let (da, db) = (table[a.index()], table[b.index()]);
    if da <= db {
        if mask.has(a) { da } else { db }
    } else if mask.has(b) {
        db
    } else {
        da
    }
}

pub(crate) fn log_failure(result: Result<()>, what: &str) {
    if let Err(e) = result {
        log::error!("{}: {}", what, e);
    }
}

/// The motion HAL core.
pub struct MotionHal {
    pub(crate) config: HalConfig,
    pub(crate) sysfs: Box<dyn SysfsAttrs>,
    pub(crate) engines: Engines,
    pub(crate) fusion: Box<dyn Fusion>,
    pub(crate) notifications: Notifications,
    pub(crate) decoder: Decoder,

    pub(crate) enabled: SensorMask,
    pub(crate) batch_enabled: SensorMask,
    /// Batch mode as last applied to hardware.
    pub(crate) old_batch_mode: bool,
    pub(crate) local: EngineMask,
    /// Engines that are actually attached.
    pub(crate) master: EngineMask,
    pub(crate) features: Features,

    pub(crate) delays: [i64; SensorKind::COUNT],
    pub(crate) batch_delays: [i64; SensorKind::COUNT],
    pub(crate) batch_timeouts: [i64; SensorKind::COUNT],
    negotiated: [Option<i64>; 4],

    pub(crate) dmp_loaded: bool,
    pub(crate) dmp_on: bool,
    pub(crate) pedometer_enabled: bool,
    pub(crate) step_count_enabled: bool,
    pub(crate) smd_enabled: bool,
    pub(crate) step_poll_ns: Option<i64>,
    pub(crate) last_step_poll: Instant,
    pub(crate) last_step_count: u64,

    pub(crate) chip: String,
    pub(crate) scales: Scales,
    pub(crate) bias: BiasState,
    pub(crate) have_good_mpu_cal: bool,
    pub(crate) accel_accuracy: i32,
    pub(crate) compass_accuracy: i32,
    /// Last complete 6-axis quaternion, written when the 6-axis engine starts.
    pub(crate) initial_6quat: Option<[i32; 4]>,

    pub(crate) flush: FlushState,
    pub(crate) data_marker: bool,
    pub(crate) empty_marker: bool,
    pub(crate) ped_update: u16,
    pub(crate) step_timestamp: i64,
    pub(crate) pressure_raw: i32,
    pub(crate) pressure_timestamp: i64,
    pub(crate) pressure_update: bool,
    pub(crate) last_temp_timestamp: i64,
    epoch: Instant,
}

impl std::fmt::Debug for MotionHal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionHal")
            .field("chip", &self.chip)
            .field("engines", &self.engines)
            .field("enabled", &self.enabled)
            .field("batch_enabled", &self.batch_enabled)
            .field("local", &self.local)
            .field("features", &self.features)
            .field("dmp_loaded", &self.dmp_loaded)
            .finish_non_exhaustive()
    }
}

impl MotionHal {
    /// Build the HAL over the IIO directory named in `config`.
    pub fn open(config: HalConfig, engines: Engines, fusion: Box<dyn Fusion>) -> Result<MotionHal> {
        let sysfs = IioSysfs::new(config.iio_path.clone());
        MotionHal::new(config, Box::new(sysfs), engines, fusion)
    }

    pub fn new(
        config: HalConfig,
        mut sysfs: Box<dyn SysfsAttrs>,
        mut engines: Engines,
        mut fusion: Box<dyn Fusion>,
    ) -> Result<MotionHal> {
        let chip = match sysfs.read_string(Attr::Part) {
            Ok(part) => part.trim().to_string(),
            Err(e) => {
                log::warn!("Cannot read chip id: {}", e);
                String::new()
            }
        };
        let scales = Scales::derive(
            &chip,
            engines.get(Engine::Gyro),
            engines.get(Engine::Accel),
            engines.get(Engine::Compass),
        );
        log::info!(
            "Motion processor {:?}: gyro {} dps, accel {} g, engines {:?}",
            chip,
            scales.gyro,
            scales.accel,
            engines
        );

        sysfs.write_int(Attr::SmdThreshold, config.smd_threshold)?;
        calibration::init_bias(
            sysfs.as_mut(),
            engines.gyro.as_deref_mut(),
            engines.accel.as_deref_mut(),
        )?;

        if let Some(gyro) = engines.gyro.as_deref() {
            fusion.set_orientation(Engine::Gyro, gyro.matrix(), scales.gyro << 15);
        }
        if let Some(accel) = engines.accel.as_deref() {
            fusion.set_orientation(Engine::Accel, accel.matrix(), scales.accel << 15);
        }
        if let Some(compass) = engines.compass.as_deref_mut() {
            let matrix = compass.matrix();
            // fusion owns the mounting matrix from here on
            compass.set_matrix([0; 9]);
            fusion.set_orientation(Engine::Compass, matrix, scales.compass);
        }
        fusion.set_rate(FusionRate::Gyro, DEFAULT_MPL_RATE_US);
        fusion.set_rate(FusionRate::Compass, DEFAULT_MPL_RATE_US);

        let mut master = EngineMask::empty();
        for engine in Engine::ALL {
            master.set_engine(engine, engines.has(engine));
        }

        let mut hal = MotionHal {
            config,
            sysfs,
            engines,
            fusion,
            notifications: Notifications::new(),
            decoder: Decoder::new(),
            enabled: SensorMask::empty(),
            batch_enabled: SensorMask::empty(),
            old_batch_mode: false,
            local: EngineMask::empty(),
            master,
            features: Features::empty(),
            delays: [DEFAULT_DELAY_NS; SensorKind::COUNT],
            batch_delays: [DEFAULT_DELAY_NS; SensorKind::COUNT],
            batch_timeouts: [NO_BATCH_TIMEOUT; SensorKind::COUNT],
            negotiated: [None; 4],
            dmp_loaded: false,
            dmp_on: false,
            pedometer_enabled: false,
            step_count_enabled: false,
            smd_enabled: false,
            step_poll_ns: None,
            last_step_poll: Instant::now(),
            last_step_count: 0,
            chip,
            scales,
            bias: BiasState::default(),
            have_good_mpu_cal: false,
            accel_accuracy: 0,
            compass_accuracy: 0,
            initial_6quat: None,
            flush: FlushState::default(),
            data_marker: false,
            empty_marker: false,
            ped_update: 0,
            step_timestamp: 0,
            pressure_raw: 0,
            pressure_timestamp: 0,
            pressure_update: false,
            last_temp_timestamp: 0,
            epoch: Instant::now(),
        };

        match hal.fusion.load_calibration() {
            Ok(()) => hal.pull_calibration(),
            Err(e) => log::warn!("Calibration not loaded: {}", e),
        }

        hal.enable_gyro(false)?;
        hal.enable_accel(false)?;
        hal.enable_compass(false)?;
        hal.enable_pressure(false)?;

        for attr in [
            Attr::BatchmodeTimeout,
            Attr::SixAxesQOn,
            Attr::PedQOn,
            Attr::StepDetectorOn,
            Attr::StepIndicatorOn,
        ] {
            let res = hal.write_attr(attr, 0);
            log_failure(res, "clearing batch features");
        }
        let res = hal.enable_quaternion_data(false);
        log_failure(res, "disabling LP quaternion");

        Ok(hal)
    }

    /// Sending side of the fusion notification channel.
    pub fn notifier(&self) -> Notifier {
        self.notifications.notifier()
    }

    pub fn enabled(&self) -> SensorMask {
        self.enabled
    }

    pub fn batch_enabled(&self) -> SensorMask {
        self.batch_enabled
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn local_mask(&self) -> EngineMask {
        self.local
    }

    pub fn chip(&self) -> &str {
        &self.chip
    }

    /// Requested period for `kind`, in nanoseconds.
    pub fn delay(&self, kind: SensorKind) -> i64 {
        self.delays[kind.index()]
    }

    /// Period last pushed to an engine's adapter.
    pub fn negotiated_period(&self, engine: Engine) -> Option<i64> {
        self.negotiated[engine as usize]
    }

    /// Nanoseconds on the HAL's monotonic clock.
    pub(crate) fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    pub(crate) fn write_attr(&mut self, attr: Attr, value: i64) -> Result<()> {
        if self.config.log.sysfs {
            log::debug!("sysfs: echo {} > {}", value, attr);
        }
        self.sysfs.write_int(attr, value).map_err(|e| {
            log::error!("Cannot write {}: {}", attr, e);
            e
        })
    }

    /// Engine groups that are both wanted and attached.
    pub(crate) fn active(&self) -> EngineMask {
        self.local & self.master
    }

    pub(crate) fn lpq_available(&self) -> bool {
        self.config.lp_quat && self.dmp_loaded
    }

    pub(crate) fn lpq_rate_supported(&self) -> bool {
        self.config.lpq_at_fastest || self.delays[SensorKind::GameRotationVector.index()] > RATE_200HZ
    }

    /// Recompute batch mode for `batch`, updating the BATCH_MODE feature bit.
    pub(crate) fn compute_batch_mode(&mut self, batch: SensorMask) -> bool {
        let selection = select_features(self.enabled, batch, self.features);
        self.features = selection.features;
        selection.batch_mode
    }

    fn apply_batch_mode(&mut self, mode: bool) {
        if self.old_batch_mode != mode || mode {
            let res = self.set_batch(mode);
            log_failure(res, "set batch mode");
        }
        self.old_batch_mode = mode;
    }

    // -- calibration --

    /// Pull freshly loaded calibration out of the fusion library and apply it.
    fn pull_calibration(&mut self) {
        self.refresh_compass_bias();
        self.refresh_gyro_bias();
        self.bias.accel.update(self.fusion.accel_bias());
        self.bias.factory_gyro.update(self.fusion.factory_gyro_bias());
        self.bias.factory_accel.update(self.fusion.factory_accel_bias());

        if let Some(gyro) = self.engines.gyro.as_deref_mut() {
            let res = calibration::apply_factory_gyro_bias(&mut self.bias, gyro, &self.scales);
            log_failure(res, "factory gyro bias");
        }
        if let Some(accel) = self.engines.accel.as_deref_mut() {
            let res = calibration::apply_factory_accel_bias(&mut self.bias, accel, &self.scales);
            log_failure(res, "factory accel bias");
        }
        self.apply_gyro_bias();
        let res = calibration::apply_accel_bias(&mut self.bias, self.sysfs.as_mut());
        log_failure(res, "accel bias");
    }

    pub(crate) fn refresh_gyro_bias(&mut self) {
        let rad = calibration::gyro_bias_to_rad(
            self.fusion.gyro_bias(),
            self.fusion.gyro_sensitivity(),
            &self.scales,
        );
        if rad.iter().any(|b| *b != 0.0) {
            self.bias.gyro.update(rad);
        } else {
            self.bias.gyro.values = rad;
        }
    }

    pub(crate) fn refresh_compass_bias(&mut self) {
        if !self.engines.has_compass() {
            return;
        }
        self.bias.compass.values = calibration::compass_bias_to_ut(
            self.fusion.compass_bias(),
            self.fusion.compass_sensitivity(),
            &self.scales,
        );
    }

    pub(crate) fn apply_gyro_bias(&mut self) {
        let units = self.fusion.gyro_bias_dmp_units();
        let res = calibration::apply_gyro_bias(&mut self.bias, self.sysfs.as_mut(), units);
        log_failure(res, "gyro bias");
    }

    pub(crate) fn apply_accel_bias(&mut self) {
        let res = calibration::apply_accel_bias(&mut self.bias, self.sysfs.as_mut());
        log_failure(res, "accel bias");
    }

    fn store_calibration(&mut self) {
        if !(self.have_good_mpu_cal || self.accel_accuracy >= 2 || self.compass_accuracy >= 3) {
            return;
        }
        match self.fusion.store_calibration() {
            Ok(()) => {
                if self.config.log.process {
                    log::debug!("Calibration stored");
                }
            }
            Err(e) => log::error!("Cannot store calibration: {}", e),
        }
    }

    fn store_calibration_once(&mut self, stored: &mut bool) {
        if !*stored {
            *stored = true;
            self.store_calibration();
        }
    }

    // -- per-engine power --

    pub(crate) fn enable_gyro(&mut self, on: bool) -> Result<()> {
        let res = match self.engines.gyro.as_deref_mut() {
            Some(gyro) => gyro.enable(on),
            None => return Ok(()),
        };
        if !on || res.is_err() {
            self.fusion.gyro_was_turned_off();
        }
        let temp = match self.engines.gyro_temp.as_deref_mut() {
            Some(temp) => temp.enable(on),
            None => Ok(()),
        };
        res.and(temp)
    }

    pub(crate) fn enable_accel(&mut self, on: bool) -> Result<()> {
        let res = match self.engines.accel.as_deref_mut() {
            Some(accel) => accel.enable(on),
            None => return Ok(()),
        };
        if !on || res.is_err() {
            self.fusion.accel_was_turned_off();
        }
        res
    }

    pub(crate) fn enable_compass(&mut self, on: bool) -> Result<()> {
        let res = match self.engines.compass.as_deref_mut() {
            Some(compass) => compass.enable(on),
            None => return Ok(()),
        };
        if !on || res.is_err() {
            self.fusion.compass_was_turned_off();
        }
        res
    }

    pub(crate) fn enable_pressure(&mut self, on: bool) -> Result<()> {
        match self.engines.pressure.as_deref_mut() {
            Some(pressure) => pressure.enable(on),
            None => Ok(()),
        }
    }

    // -- enable --

    /// Turn a sensor on or off for its consumer.
    pub fn enable(&mut self, kind: SensorKind, on: bool) -> Result<()> {
        if self.config.log.process {
            log::debug!(
                "enable {} {} -> {}",
                kind,
                if self.enabled.has(kind) { "en" } else { "dis" },
                if on { "en" } else { "dis" }
            );
        }
        if !on {
            self.batch_enabled.remove(kind.bit());
        }

        match kind {
            SensorKind::StepCounter => {
                let res = self.enable_dmp_pedometer(on, false);
                self.step_count_enabled = on && res.is_ok();
                return res;
            }
            SensorKind::StepDetector => {
                let res = self.enable_dmp_pedometer(on, true);
                self.pedometer_enabled = on && res.is_ok();
                let mode = self.compute_batch_mode(self.batch_enabled);
                self.apply_batch_mode(mode);
                return res;
            }
            SensorKind::SignificantMotion => {
                let res = self.enable_dmp_significant_motion(on);
                self.smd_enabled = on && res.is_ok();
                return res;
            }
            _ => {}
        }

        if self.enabled.has(kind) == on {
            return Ok(());
        }

        let last = self.enabled;
        self.enabled.set(kind.bit(), on);
        self.local = compute_local_sensor_mask(self.local, self.enabled, self.batch_enabled, self.features);
        let sensors = self.active();

        let mut stored = false;
        let mut changed = SensorMask::empty();
        let enabled = self.enabled;
        match kind {
            SensorKind::Gyro | SensorKind::RawGyro | SensorKind::Accelerometer => {
                if !enabled.intersects(SensorMask::GYRO_SIX_AXIS | SensorMask::NINE_AXIS) {
                    changed |= kind.bit();
                }
                if self.features.contains(Features::SIX_AXIS_QUATERNION) {
                    changed |= kind.bit();
                }
            }
            SensorKind::MagneticField | SensorKind::RawMagneticField => {
                if !enabled.intersects(SensorMask::NINE_AXIS) {
                    changed |= kind.bit();
                }
            }
            SensorKind::Pressure => changed |= kind.bit(),
            SensorKind::GameRotationVector | SensorKind::GeomagneticRotationVector => {
                if !on {
                    self.store_calibration_once(&mut stored);
                }
                let (other, first) = if kind == SensorKind::GameRotationVector {
                    (SensorMask::MAG_SIX_AXIS, SensorKind::Gyro)
                } else {
                    (SensorMask::GYRO_SIX_AXIS, SensorKind::Accelerometer)
                };
                if (on && !last.intersects(SensorMask::ALL_FUSION))
                    || (on && !last.intersects(SensorMask::NINE_AXIS))
                    || (!on && !enabled.intersects(SensorMask::ALL_FUSION))
                    || (!on && enabled.intersects(other))
                {
                    changed |= idle_hardware(enabled, first);
                }
            }
            SensorKind::Orientation
            | SensorKind::RotationVector
            | SensorKind::LinearAccel
            | SensorKind::Gravity => {
                if !on {
                    self.store_calibration_once(&mut stored);
                }
                if (on && !last.intersects(SensorMask::NINE_AXIS))
                    || (!on && !enabled.intersects(SensorMask::NINE_AXIS))
                {
                    changed |= idle_hardware(enabled, SensorKind::Gyro);
                }
            }
            SensorKind::SignificantMotion | SensorKind::StepDetector | SensorKind::StepCounter => {}
        }

        if self.config.log.extra {
            log::debug!("enable {}: sensors {:?} changed {:?}", kind, sensors, changed);
        }
        self.enable_sensors(sensors, on, changed, &mut stored)
    }

    fn enable_sensors(
        &mut self,
        sensors: EngineMask,
        on: bool,
        changed: SensorMask,
        stored: &mut bool,
    ) -> Result<()> {
        if changed.intersects(SensorMask::GYRO | SensorMask::RAW_GYRO) {
            self.enable_gyro(sensors.has(Engine::Gyro))?;
            if !on && changed.contains(SensorMask::GYRO) {
                self.store_calibration_once(stored);
            }
        }
        if changed.contains(SensorMask::ACCEL) {
            self.enable_accel(sensors.has(Engine::Accel))?;
            if !sensors.has(Engine::Accel) {
                self.store_calibration_once(stored);
            }
        }
        if changed.intersects(SensorMask::MAGNETIC_FIELD | SensorMask::RAW_MAGNETIC_FIELD) {
            self.enable_compass(sensors.has(Engine::Compass))?;
            if !on && changed.contains(SensorMask::MAGNETIC_FIELD) {
                self.store_calibration_once(stored);
            }
        }
        if changed.contains(SensorMask::PRESSURE) {
            self.enable_pressure(sensors.has(Engine::Pressure))?;
        }

        if self.lpq_available() {
            let wants_quat = self
                .enabled
                .intersects(SensorMask::NINE_AXIS | SensorMask::GYRO_SIX_AXIS);
            let active = self.features.contains(Features::QUATERNION);
            if wants_quat && !active {
                let res = self.enable_lp_quaternion(true);
                log_failure(res, "enable LP quaternion");
            } else if !wants_quat && active {
                let res = self.enable_lp_quaternion(false);
                log_failure(res, "disable LP quaternion");
            }
        }

        // biases can only be written while the engine is idle
        if !sensors.has(Engine::Gyro) {
            self.apply_gyro_bias();
        }
        if !sensors.has(Engine::Accel) {
            self.apply_accel_bias();
        }

        let batch_mode = self.compute_batch_mode(self.batch_enabled);
        self.apply_batch_mode(batch_mode);

        let engines_on = sensors.intersects(EngineMask::FUSION);
        if changed.intersects(HARDWARE_CHANGE) {
            if self.smd_enabled || self.pedometer_enabled || self.step_count_enabled || engines_on {
                self.write_attr(Attr::DmpEventIntOn, 0)?;
                let exclusive = Features::SIX_AXIS_QUATERNION
                    | Features::PED_STANDALONE
                    | Features::PED_QUATERNION
                    | Features::BATCH_MODE;
                if self.features.intersects(Features::DMP_FEATURES)
                    && !self.features.intersects(exclusive)
                {
                    let res = self.on_dmp(true);
                    log_failure(res, "enable DMP");
                    self.enable_accel(true)?;
                    if !(sensors | self.local).has(Engine::Accel) {
                        self.turn_off_accel_fifo()?;
                    }
                }
            } else {
                self.store_calibration_once(stored);
            }
        } else if !engines_on {
            self.store_calibration_once(stored);
        }

        if !batch_mode {
            let res = self.reset_data_rates();
            log_failure(res, "reset data rates");
        }
        Ok(())
    }

    // -- rates --

    /// Request a sampling period for `kind`.
    ///
    /// Periods below 5 ms are raised to 5 ms. A request slower than another
    /// enabled consumer of the same engine is recorded but leaves the hardware
    /// rate alone.
    pub fn set_delay(&mut self, kind: SensorKind, period_ns: i64) -> Result<()> {
        if period_ns < 0 {
            return Err(HalError::InvalidArgument(format!(
                "negative delay {} for {}",
                period_ns, kind
            )));
        }
        let ns = period_ns.max(RATE_200HZ);
        let previous = std::mem::replace(&mut self.delays[kind.index()], ns);
        if self.config.log.process {
            log::debug!("set_delay {} {} ns ({} Hz)", kind, ns, hz(ns));
        }

        let enabled = self.enabled;
        let retuned = enabled.has(kind) && previous != ns;
        let delays = self.delays;
        let slower_than = |others: &[SensorKind]| {
            others
                .iter()
                .any(|&k| k != kind && enabled.has(k) && ns > delays[k.index()])
        };

        match kind {
            SensorKind::StepCounter => self.step_poll_ns = Some(ns),
            SensorKind::StepDetector | SensorKind::SignificantMotion => {}
            SensorKind::Gyro | SensorKind::RawGyro | SensorKind::Accelerometer => {
                let same_fifo = [
                    SensorKind::Gyro,
                    SensorKind::RawGyro,
                    SensorKind::Accelerometer,
                    SensorKind::MagneticField,
                ];
                if !retuned && slower_than(&same_fifo) {
                    return Ok(());
                }
            }
            SensorKind::MagneticField | SensorKind::RawMagneticField => {
                let feeders = [SensorKind::Gyro, SensorKind::RawGyro, SensorKind::Accelerometer];
                if !retuned
                    && slower_than(&feeders)
                    && !self.features.contains(Features::BATCH_MODE)
                {
                    return Ok(());
                }
            }
            k if SensorMask::ALL_FUSION.has(k) => {
                if !self.lpq_available() && slower_than(&SensorKind::ALL) {
                    return Ok(());
                }
            }
            _ => {}
        }

        self.update_delay()
    }

    fn min_enabled_delay(&self) -> i64 {
        self.enabled
            .kinds()
            .map(|k| self.delays[k.index()])
            .fold(DEFAULT_DELAY_NS, i64::min)
    }

    fn compass_min_delay(&self) -> i64 {
        self.engines
            .get(Engine::Compass)
            .map_or(0, |c| c.descriptor().min_delay_us * 1000)
    }

    /// Push a period to an engine's adapter and remember it.
    fn push_delay(&mut self, engine: Engine, period_ns: i64) {
        let Some(sensor) = self.engines.get_mut(engine) else {
            return;
        };
        match sensor.set_delay(period_ns) {
            Ok(()) => self.negotiated[engine as usize] = Some(period_ns),
            Err(e) => log::error!("{} update delay error: {}", engine, e),
        }
    }

    fn push_compass_delay(&mut self, period_ns: i64) {
        let period_ns = period_ns.max(self.compass_min_delay());
        self.push_delay(Engine::Compass, period_ns);
    }

    fn set_mpl_rates(&mut self, gyro_ns: i64, accel_ns: i64, compass_ns: i64) {
        self.fusion.set_rate(FusionRate::Gyro, gyro_ns / 1000);
        self.fusion.set_rate(FusionRate::Accel, accel_ns / 1000);
        self.fusion.set_rate(FusionRate::Compass, compass_ns / 1000);
    }

    fn set_virtual_rates(&mut self, period_ns: i64) {
        for rate in FusionRate::VIRTUAL {
            self.fusion.set_rate(rate, period_ns / 1000);
        }
    }

    /// DMP output rate for a wanted period.
    ///
    /// While the DMP runs, the quaternion rates follow `wanted` and the FIFO
    /// itself stays at 200 Hz.
    pub(crate) fn dmp_rate(&mut self, wanted: i64) -> i64 {
        if !self.dmp_on {
            return wanted;
        }
        let rate = hz(wanted);
        let res = self.write_attr(Attr::ThreeAxesQRate, rate);
        log_failure(res, "three axes quaternion rate");
        if self.features.contains(Features::BATCH_MODE) {
            let res = self.write_attr(Attr::SixAxesQRate, rate);
            log_failure(res, "six axes quaternion rate");
            let res = self.write_attr(Attr::PedQRate, rate);
            log_failure(res, "ped quaternion rate");
        }
        RATE_200HZ
    }

    fn update_delay(&mut self) -> Result<()> {
        if self.enabled.is_empty() {
            return Ok(());
        }
        let wanted = self.min_enabled_delay();

        if self.features.contains(Features::BATCH_MODE) {
            self.set_batch_data_rates();
            return Ok(());
        }

        let fifo = self.dmp_rate(wanted);
        self.write_attr(Attr::SamplingFrequency, hz(fifo))?;

        if self.enabled.intersects(SensorMask::ALL_FUSION) {
            self.set_mpl_rates(wanted, wanted, wanted);
            self.set_virtual_rates(wanted);

            if self.features.intersects(Features::DMP_FEATURES)
                && self.features.contains(Features::QUATERNION)
            {
                if wanted <= RATE_200HZ {
                    if !self.config.lpq_at_fastest {
                        let res = self.enable_lp_quaternion(false);
                        log_failure(res, "disable LP quaternion");
                    }
                } else {
                    self.fusion.set_rate(FusionRate::Quat, wanted / 1000);
                }
            }

            self.push_delay(Engine::Gyro, wanted);
            self.push_delay(Engine::Accel, wanted);
            if self.engines.has_compass() {
                self.push_compass_delay(wanted);
            }
            return Ok(());
        }

        let enabled = self.enabled;
        let d = self.delays;
        let gyro_on = enabled.has(SensorKind::Gyro);
        let raw_gyro_on = enabled.has(SensorKind::RawGyro);

        if gyro_on || raw_gyro_on {
            let ns = pair_delay(&d, enabled, SensorKind::Gyro, SensorKind::RawGyro);
            self.fusion.set_rate(FusionRate::Gyro, ns / 1000);
            self.push_delay(Engine::Gyro, ns);
        }

        if enabled.has(SensorKind::Accelerometer) {
            // one FIFO rate for gyro and accel
            let accel = d[SensorKind::Accelerometer.index()];
            let ns = if gyro_on && d[SensorKind::Gyro.index()] < accel {
                d[SensorKind::Gyro.index()]
            } else if raw_gyro_on && d[SensorKind::RawGyro.index()] < accel {
                d[SensorKind::RawGyro.index()]
            } else {
                accel
            };
            self.fusion.set_rate(FusionRate::Accel, ns / 1000);
            self.push_delay(Engine::Accel, ns);
        }

        if enabled.intersects(SensorMask::MAGNETIC_FIELD | SensorMask::RAW_MAGNETIC_FIELD) {
            let ns = pair_delay(&d, enabled, SensorKind::MagneticField, SensorKind::RawMagneticField);
            self.push_delay(Engine::Compass, ns);
            if let Some(compass) = self.engines.compass.as_deref_mut() {
                match compass.get_delay() {
                    Ok(got) => self.fusion.set_rate(FusionRate::Compass, got / 1000),
                    Err(e) => log::error!("compass get delay: {}", e),
                }
            }
        }

        if enabled.has(SensorKind::Pressure) {
            self.push_delay(Engine::Pressure, d[SensorKind::Pressure.index()]);
        }
        Ok(())
    }

    /// Rates for batch mode: each engine follows its own batch delay.
    pub(crate) fn set_batch_data_rates(&mut self) {
        let batch = self.batch_enabled;
        let bd = self.batch_delays;

        let (gyro, accel, compass, pressure) = if self.config.multi_rate {
            let gyro = if batch.intersects(SensorMask::GYRO | SensorMask::RAW_GYRO) {
                pair_delay(&bd, batch, SensorKind::Gyro, SensorKind::RawGyro)
            } else {
                bd[SensorKind::Gyro.index()]
            };
            let compass =
                if batch.intersects(SensorMask::MAGNETIC_FIELD | SensorMask::RAW_MAGNETIC_FIELD) {
                    pair_delay(&bd, batch, SensorKind::MagneticField, SensorKind::RawMagneticField)
                } else {
                    bd[SensorKind::MagneticField.index()]
                };
            let accel = bd[SensorKind::Accelerometer.index()];
            let pressure = bd[SensorKind::Pressure.index()];

            if self
                .features
                .intersects(Features::PED_QUATERNION | Features::SIX_AXIS_QUATERNION)
            {
                let quat = bd[SensorKind::GameRotationVector.index()];
                self.fusion.set_rate(FusionRate::Quat, quat / 1000);
                self.fusion.set_rate(FusionRate::SixAxisRotationVector, quat / 1000);
                self.dmp_rate(quat);
            }
            self.set_mpl_rates(gyro, accel, compass);
            (gyro, accel, compass, pressure)
        } else {
            let wanted = batch
                .kinds()
                .map(|k| bd[k.index()])
                .fold(DEFAULT_DELAY_NS, i64::min);
            (wanted, wanted, wanted, wanted)
        };

        if self.config.log.batching {
            log::debug!(
                "batch rates: gyro {} accel {} compass {} pressure {}",
                gyro,
                accel,
                compass,
                pressure
            );
        }
        self.push_delay(Engine::Gyro, gyro);
        self.push_delay(Engine::Accel, accel);
        if self.engines.has_compass() {
            self.push_compass_delay(compass);
        }
        self.push_delay(Engine::Pressure, pressure);
    }

    /// Return every engine to the fastest enabled consumer's period.
    pub(crate) fn reset_data_rates(&mut self) -> Result<()> {
        if self.enabled.is_empty() {
            return Ok(());
        }
        let wanted = self.min_enabled_delay();
        if self.config.log.process {
            log::debug!("reset data rates to {} ns for {:?}", wanted, self.enabled);
        }

        self.set_mpl_rates(wanted, wanted, wanted);
        self.set_virtual_rates(wanted);

        let fifo = self.dmp_rate(wanted);
        self.write_attr(Attr::SamplingFrequency, hz(fifo))?;

        self.push_delay(Engine::Gyro, wanted);
        self.push_delay(Engine::Accel, wanted);
        if self.engines.has_compass() {
            self.push_compass_delay(wanted);
        }
        self.push_delay(Engine::Pressure, wanted);

        if self.features.contains(Features::QUATERNION)
            && wanted <= RATE_200HZ
            && !self.config.lpq_at_fastest
        {
            let res = self.enable_lp_quaternion(false);
            log_failure(res, "disable LP quaternion");
        }
        Ok(())
    }

    // -- batching --

    /// Configure hardware batching for `kind`.
    ///
    /// Physical kinds go straight to their adapter. Everything else needs the
    /// DMP; only the game rotation vector and the step detector accept a
    /// non-zero timeout.
    pub fn batch(
        &mut self,
        kind: SensorKind,
        flags: i32,
        period_ns: i64,
        timeout_ns: i64,
    ) -> Result<BatchOutcome> {
        if let Some(engine) = engine_of(kind) {
            let sensor = self
                .engines
                .get_mut(engine)
                .ok_or_else(|| HalError::InvalidArgument(format!("no {} engine for {}", engine, kind)))?;
            sensor.batch(flags, period_ns, timeout_ns)?;
            return Ok(BatchOutcome::Delegated(engine));
        }

        if !self.dmp_loaded {
            return Ok(BatchOutcome::NoDmp);
        }
        if self.config.log.batching {
            log::debug!(
                "batch {} flags {:#x} period {} timeout {}",
                kind,
                flags,
                period_ns,
                timeout_ns
            );
        }
        if flags & BATCH_WAKE_UPON_FIFO_FULL != 0 {
            return Err(HalError::InvalidArgument(
                "wake upon FIFO full is not supported".into(),
            ));
        }
        let period = period_ns.max(RATE_200HZ);
        let batching = timeout_ns > 0;
        if batching
            && !matches!(kind, SensorKind::GameRotationVector | SensorKind::StepDetector)
        {
            return Err(HalError::InvalidArgument(format!("{} cannot batch", kind)));
        }
        if flags & BATCH_DRY_RUN != 0 {
            return Ok(BatchOutcome::DryRun);
        }

        let mut requested = self.batch_enabled;
        requested.set(kind.bit(), batching);
        let batch_mode = self.compute_batch_mode(requested);

        let i = kind.index();
        self.batch_enabled = requested;
        self.delays[i] = period;
        if batching {
            self.batch_delays[i] = period;
            self.batch_timeouts[i] = timeout_ns;
        } else {
            self.batch_delays[i] = DEFAULT_DELAY_NS;
            self.batch_timeouts[i] = NO_BATCH_TIMEOUT;
        }

        if self.old_batch_mode != batch_mode || batch_mode {
            self.old_batch_mode = batch_mode;
            self.reconfigure_batch(kind, batch_mode);
        }

        if batch_mode {
            self.set_batch_data_rates();
        } else {
            let res = self.reset_data_rates();
            log_failure(res, "reset data rates");
        }

        let data_interrupt = !self.enabled.is_empty() || self.features.contains(Features::BATCH_MODE);
        self.write_attr(Attr::DmpEventIntOn, (!data_interrupt) as i64)?;
        Ok(BatchOutcome::Applied { batch_mode })
    }

    /// Switch the DMP outputs to match the batch mask after a `batch` call.
    fn reconfigure_batch(&mut self, kind: SensorKind, batch_mode: bool) {
        let output = compute_batch_data_output(self.batch_enabled);
        let timeout_ms = self.batch_timeout_ms(batch_mode, output);
        if self.config.log.batching {
            log::debug!(
                "batch mode {} output {:?} timeout {} ms enabled {:?}",
                batch_mode,
                output,
                timeout_ms,
                self.enabled
            );
        }

        let pedometer = self.features.contains(Features::PEDOMETER);
        let source = select_quaternion(output, self.features, batch_mode, self.enabled);
        let grv_rate = hz(self.batch_delays[SensorKind::GameRotationVector.index()]);

        let standalone = batch_mode && output.contains(Features::PED_STANDALONE) && pedometer;
        let res = self.enable_ped_standalone(standalone);
        log_failure(res, "ped standalone");

        self.apply_ped_quat_source(source, output, Some(grv_rate));

        let indicator = batch_mode && output.contains(Features::PED_INDICATOR);
        let res = self.enable_ped_indicator(indicator);
        log_failure(res, "ped indicator");

        let seed = kind == SensorKind::GameRotationVector;
        self.apply_six_axis_source(source, output, Some(grv_rate), seed);

        let res = self.write_attr(Attr::BatchmodeTimeout, timeout_ms);
        log_failure(res, "batch timeout");
        if let Err(e) = self.compute_and_set_dmp_state() {
            log::error!("Cannot compute DMP state: {}", e);
        }
    }

    /// Run the pedometer quaternion when `source` names it. Otherwise fall back
    /// to LPQ for GRV unless the standalone pedometer owns the output.
    fn apply_ped_quat_source(&mut self, source: QuatSource, output: Features, rate: Option<i64>) {
        if source == QuatSource::PedQuat {
            let res = self.enable_lp_quaternion(false);
            log_failure(res, "LP quaternion");
            let res = self.enable_ped_quaternion(true);
            log_failure(res, "ped quaternion");
            if let Some(rate) = rate {
                let res = self.write_attr(Attr::PedQRate, rate);
                log_failure(res, "ped quaternion rate");
            }
            return;
        }
        if !output.contains(Features::PED_STANDALONE) && self.enabled.has(SensorKind::GameRotationVector) {
            let lpq = self.lpq_available() && self.lpq_rate_supported();
            let res = self.enable_lp_quaternion(lpq);
            log_failure(res, "LP quaternion");
        }
        let res = self.enable_ped_quaternion(false);
        log_failure(res, "ped quaternion");
    }

    /// Same for the 6-axis quaternion. `seed` writes the cached initial quaternion.
    fn apply_six_axis_source(&mut self, source: QuatSource, output: Features, rate: Option<i64>, seed: bool) {
        if source == QuatSource::SixAxis {
            let res = self.enable_lp_quaternion(false);
            log_failure(res, "LP quaternion");
            let res = self.enable_6axis_quaternion(true);
            log_failure(res, "6-axis quaternion");
            if seed {
                self.set_initial_6quat();
            }
            if let Some(rate) = rate {
                let res = self.write_attr(Attr::SixAxesQRate, rate);
                log_failure(res, "6-axis quaternion rate");
            }
            return;
        }
        if !output.contains(Features::PED_QUATERNION) && self.enabled.has(SensorKind::GameRotationVector) {
            let lpq = self.lpq_available() && self.lpq_rate_supported();
            let res = self.enable_lp_quaternion(lpq);
            log_failure(res, "LP quaternion");
        }
        let res = self.enable_6axis_quaternion(false);
        log_failure(res, "6-axis quaternion");
    }

    fn batch_timeout_ms(&self, batch_mode: bool, output: Features) -> i64 {
        if !batch_mode {
            return 0;
        }
        min_batch_timeout(self.enabled, self.batch_enabled, output, &self.batch_timeouts)
            .unwrap_or(NO_BATCH_TIMEOUT)
            / 1_000_000
    }

    /// Enter or leave batch mode after an enable change.
    pub(crate) fn set_batch(&mut self, on: bool) -> Result<()> {
        let output = compute_batch_data_output(self.batch_enabled);
        let timeout_ms = self.batch_timeout_ms(on, output);
        if self.config.log.batching {
            log::debug!("set batch {} output {:?} timeout {} ms", on, output, timeout_ms);
        }

        let pedometer = self.features.contains(Features::PEDOMETER);
        let source = select_quaternion(output, self.features, on, self.enabled);

        let standalone = on && pedometer && output.contains(Features::PED_STANDALONE);
        let res = self.enable_ped_standalone(standalone);
        log_failure(res, "ped standalone");

        if source == QuatSource::PedQuat {
            self.apply_ped_quat_source(source, output, None);
        } else {
            let res = self.enable_ped_quaternion(false);
            log_failure(res, "ped quaternion");
        }

        let indicator = on
            && output.contains(Features::PED_INDICATOR)
            && (!self.enabled.is_empty() || self.features.contains(Features::PED_STANDALONE));
        let res = self.enable_ped_indicator(indicator);
        log_failure(res, "ped indicator");

        self.apply_six_axis_source(source, output, None, true);

        let res = self.write_attr(Attr::BatchmodeTimeout, timeout_ms);
        log_failure(res, "batch timeout");

        if on {
            self.on_dmp(true)?;
            self.set_batch_data_rates();
            self.write_attr(Attr::SamplingFrequency, hz(RATE_200HZ))?;
        } else if self.features.is_empty() {
            self.on_dmp(false)?;
            let res = self.reset_data_rates();
            log_failure(res, "reset data rates");
        }

        let data_interrupt = !self.enabled.is_empty() || self.features.contains(Features::BATCH_MODE);
        self.write_attr(Attr::DmpEventIntOn, (!data_interrupt) as i64)
    }
}

/// Hardware kinds from `first` through raw compass that no consumer enabled.
fn idle_hardware(enabled: SensorMask, first: SensorKind) -> SensorMask {
    (first.index()..=SensorKind::RawMagneticField.index())
        .filter_map(SensorKind::from_index)
        .filter(|k| !enabled.has(*k))
        .fold(SensorMask::empty(), |mask, k| mask | k.bit())
}
