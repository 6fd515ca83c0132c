//! In-memory fakes for the sysfs, adapter and fusion seams.
//!
//! Each fake shares its state with a probe handle so tests can script inputs
//! and inspect recorded calls after the fake has been moved into a
//! [`MotionHal`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::adapter::{AdapterEvent, Engines, PhysicalSensor, SensorDescriptor};
use crate::config::HalConfig;
use crate::fusion::{Fusion, FusionOutput, FusionRate};
use crate::protocol::QuatKind;
use crate::sysfs::{Attr, SysfsAttrs};
use crate::types::{Engine, SensorKind};
use crate::{HalError, MotionHal, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// -- sysfs --

#[derive(Debug, Default)]
pub(crate) struct SysfsState {
    pub values: HashMap<Attr, i64>,
    pub strings: HashMap<Attr, String>,
    pub bytes: HashMap<Attr, Vec<u8>>,
    pub writes: Vec<(Attr, i64)>,
    pub fail: HashSet<Attr>,
}

pub(crate) struct MemSysfs(Arc<Mutex<SysfsState>>);

#[derive(Clone)]
pub(crate) struct SysfsProbe(Arc<Mutex<SysfsState>>);

impl MemSysfs {
    pub fn new() -> (MemSysfs, SysfsProbe) {
        let state = Arc::new(Mutex::new(SysfsState::default()));
        (MemSysfs(state.clone()), SysfsProbe(state))
    }
}

impl SysfsProbe {
    pub fn set(&self, attr: Attr, value: i64) {
        lock(&self.0).values.insert(attr, value);
    }

    pub fn set_string(&self, attr: Attr, value: &str) {
        lock(&self.0).strings.insert(attr, value.to_string());
    }

    pub fn fail_on(&self, attr: Attr) {
        lock(&self.0).fail.insert(attr);
    }

    pub fn writes(&self) -> Vec<(Attr, i64)> {
        lock(&self.0).writes.clone()
    }

    pub fn writes_to(&self, attr: Attr) -> Vec<i64> {
        lock(&self.0)
            .writes
            .iter()
            .filter(|(a, _)| *a == attr)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn last(&self, attr: Attr) -> Option<i64> {
        self.writes_to(attr).last().copied()
    }

    pub fn bytes(&self, attr: Attr) -> Option<Vec<u8>> {
        lock(&self.0).bytes.get(&attr).cloned()
    }

    pub fn clear_writes(&self) {
        lock(&self.0).writes.clear();
    }
}

impl SysfsAttrs for MemSysfs {
    fn read_int(&mut self, attr: Attr) -> Result<i64> {
        let state = lock(&self.0);
        if state.fail.contains(&attr) {
            return Err(HalError::Sysfs(format!("{} unreadable", attr)));
        }
        Ok(state.values.get(&attr).copied().unwrap_or(0))
    }

    fn read_string(&mut self, attr: Attr) -> Result<String> {
        let state = lock(&self.0);
        state
            .strings
            .get(&attr)
            .cloned()
            .ok_or_else(|| HalError::Sysfs(format!("{} missing", attr)))
    }

    fn write_int(&mut self, attr: Attr, value: i64) -> Result<()> {
        let mut state = lock(&self.0);
        if state.fail.contains(&attr) {
            return Err(HalError::Sysfs(format!("{} unwritable", attr)));
        }
        state.writes.push((attr, value));
        state.values.insert(attr, value);
        Ok(())
    }

    fn write_bytes(&mut self, attr: Attr, bytes: &[u8]) -> Result<()> {
        let mut state = lock(&self.0);
        if state.fail.contains(&attr) {
            return Err(HalError::Sysfs(format!("{} unwritable", attr)));
        }
        state.bytes.insert(attr, bytes.to_vec());
        Ok(())
    }
}

// -- physical sensors --

#[derive(Debug)]
pub(crate) struct SensorState {
    pub engine: Engine,
    pub enables: Vec<bool>,
    pub enabled: bool,
    pub delays: Vec<i64>,
    pub delay: i64,
    pub batches: Vec<(i32, i64, i64)>,
    pub flushes: usize,
    pub offsets: Vec<(usize, f32)>,
    pub events: VecDeque<AdapterEvent>,
    pub raw: i32,
    pub scale: f64,
    pub matrix: [i8; 9],
    pub peak: f32,
    pub descriptor: SensorDescriptor,
    pub fail_flush: bool,
    pub fail_enable: bool,
}

pub(crate) struct FakeSensor(Arc<Mutex<SensorState>>);

#[derive(Clone)]
pub(crate) struct SensorProbe(Arc<Mutex<SensorState>>);

impl FakeSensor {
    pub fn new(engine: Engine) -> (FakeSensor, SensorProbe) {
        let peak = match engine {
            Engine::Gyro => 34.9,
            Engine::Accel => 19.6,
            _ => 1.0,
        };
        let state = SensorState {
            engine,
            enables: Vec::new(),
            enabled: false,
            delays: Vec::new(),
            delay: 0,
            batches: Vec::new(),
            flushes: 0,
            offsets: Vec::new(),
            events: VecDeque::new(),
            raw: 0,
            scale: 1.0,
            matrix: [1, 0, 0, 0, 1, 0, 0, 0, 1],
            peak,
            descriptor: SensorDescriptor {
                handle: engine.flush_kind().handle(),
                power: 0.5,
                max_range: peak,
                min_delay_us: if engine == Engine::Compass { 10_000 } else { 5_000 },
                fifo_reserved_event_count: 0,
                fifo_max_event_count: 100,
                version: 3,
            },
            fail_flush: false,
            fail_enable: false,
        };
        let state = Arc::new(Mutex::new(state));
        (FakeSensor(state.clone()), SensorProbe(state))
    }
}

impl SensorProbe {
    pub fn state(&self) -> MutexGuard<'_, SensorState> {
        lock(&self.0)
    }

    pub fn enables(&self) -> Vec<bool> {
        self.state().enables.clone()
    }

    pub fn delays(&self) -> Vec<i64> {
        self.state().delays.clone()
    }

    pub fn last_delay(&self) -> Option<i64> {
        self.state().delays.last().copied()
    }

    pub fn offsets(&self) -> Vec<(usize, f32)> {
        self.state().offsets.clone()
    }

    pub fn flushes(&self) -> usize {
        self.state().flushes
    }

    pub fn push(&self, event: AdapterEvent) {
        self.state().events.push_back(event);
    }

    pub fn clear(&self) {
        let mut s = self.state();
        s.enables.clear();
        s.delays.clear();
        s.offsets.clear();
        s.batches.clear();
        s.flushes = 0;
    }
}

impl PhysicalSensor for FakeSensor {
    fn enable(&mut self, on: bool) -> Result<()> {
        let mut s = lock(&self.0);
        s.enables.push(on);
        if s.fail_enable {
            return Err(HalError::adapter(s.engine, -5));
        }
        s.enabled = on;
        Ok(())
    }

    fn set_delay(&mut self, period_ns: i64) -> Result<()> {
        let mut s = lock(&self.0);
        s.delays.push(period_ns);
        s.delay = period_ns;
        Ok(())
    }

    fn get_delay(&mut self) -> Result<i64> {
        Ok(lock(&self.0).delay)
    }

    fn batch(&mut self, flags: i32, period_ns: i64, timeout_ns: i64) -> Result<()> {
        lock(&self.0).batches.push((flags, period_ns, timeout_ns));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut s = lock(&self.0);
        s.flushes += 1;
        if s.fail_flush {
            return Err(HalError::adapter(s.engine, -16));
        }
        Ok(())
    }

    fn read_events(&mut self, max: usize) -> Result<Vec<AdapterEvent>> {
        let mut s = lock(&self.0);
        let n = max.min(s.events.len());
        Ok(s.events.drain(..n).collect())
    }

    fn read_raw(&mut self) -> Result<i32> {
        Ok(lock(&self.0).raw)
    }

    fn scale(&self) -> f64 {
        lock(&self.0).scale
    }

    fn set_scale(&mut self, scale: f64) {
        lock(&self.0).scale = scale;
    }

    fn matrix(&self) -> [i8; 9] {
        lock(&self.0).matrix
    }

    fn set_matrix(&mut self, matrix: [i8; 9]) {
        lock(&self.0).matrix = matrix;
    }

    fn peak_raw(&self) -> f32 {
        lock(&self.0).peak
    }

    fn set_offset(&mut self, axis: usize, offset: f32) -> Result<()> {
        lock(&self.0).offsets.push((axis, offset));
        Ok(())
    }

    fn descriptor(&self) -> SensorDescriptor {
        lock(&self.0).descriptor
    }
}

// -- fusion --

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Build {
    Gyro([i32; 3], i64),
    Accel([i32; 3], i64),
    Compass([i32; 3], i64),
    Quat(QuatKind, [i32; 3], bool, i64),
    Pressure(i32, i64),
    Temp(i64, i64),
}

#[derive(Debug, Default)]
pub(crate) struct FusionState {
    pub builds: Vec<Build>,
    pub rates: HashMap<FusionRate, i64>,
    pub orientations: Vec<(Engine, [i8; 9], i64)>,
    pub outputs: HashMap<SensorKind, FusionOutput>,
    pub turned_off: Vec<&'static str>,
    pub stores: usize,
    pub load_fails: bool,
    pub gyro_bias: [i64; 3],
    pub gyro_sensitivity: i64,
    pub gyro_bias_dmp: [i64; 3],
    pub accel_bias: [i64; 3],
    pub accel_accuracy: i32,
    pub compass_bias: [i64; 3],
    pub compass_sensitivity: i64,
    pub compass_accuracy: i32,
    pub factory_gyro_bias: [i64; 3],
    pub factory_accel_bias: [i64; 3],
    pub six_quat: [i32; 4],
}

pub(crate) struct FakeFusion(Arc<Mutex<FusionState>>);

#[derive(Clone)]
pub(crate) struct FusionProbe(Arc<Mutex<FusionState>>);

impl FakeFusion {
    pub fn new() -> (FakeFusion, FusionProbe) {
        let state = Arc::new(Mutex::new(FusionState::default()));
        (FakeFusion(state.clone()), FusionProbe(state))
    }
}

impl FusionProbe {
    pub fn state(&self) -> MutexGuard<'_, FusionState> {
        lock(&self.0)
    }

    pub fn builds(&self) -> Vec<Build> {
        self.state().builds.clone()
    }

    pub fn rate(&self, rate: FusionRate) -> Option<i64> {
        self.state().rates.get(&rate).copied()
    }

    pub fn stores(&self) -> usize {
        self.state().stores
    }

    pub fn set_output(&self, kind: SensorKind, values: [f32; 5]) {
        self.state().outputs.insert(
            kind,
            FusionOutput {
                values,
                status: crate::types::Status::High,
                timestamp: 1_000,
                updated: true,
            },
        );
    }
}

impl Fusion for FakeFusion {
    fn build_gyro(&mut self, raw: [i32; 3], timestamp: i64) {
        lock(&self.0).builds.push(Build::Gyro(raw, timestamp));
    }

    fn build_accel(&mut self, raw: [i32; 3], timestamp: i64) {
        lock(&self.0).builds.push(Build::Accel(raw, timestamp));
    }

    fn build_compass(&mut self, raw: [i32; 3], timestamp: i64) {
        lock(&self.0).builds.push(Build::Compass(raw, timestamp));
    }

    fn build_quat(&mut self, kind: QuatKind, quat: [i32; 3], bias_applied: bool, timestamp: i64) {
        lock(&self.0).builds.push(Build::Quat(kind, quat, bias_applied, timestamp));
    }

    fn build_pressure(&mut self, raw: i32, timestamp: i64) {
        lock(&self.0).builds.push(Build::Pressure(raw, timestamp));
    }

    fn build_temp(&mut self, temperature: i64, timestamp: i64) {
        lock(&self.0).builds.push(Build::Temp(temperature, timestamp));
    }

    fn set_rate(&mut self, rate: FusionRate, period_us: i64) {
        lock(&self.0).rates.insert(rate, period_us);
    }

    fn set_orientation(&mut self, engine: Engine, matrix: [i8; 9], sensitivity: i64) {
        lock(&self.0).orientations.push((engine, matrix, sensitivity));
    }

    fn output(&mut self, kind: SensorKind) -> FusionOutput {
        let mut s = lock(&self.0);
        match s.outputs.get_mut(&kind) {
            Some(out) => {
                let current = *out;
                out.updated = false;
                current
            }
            None => FusionOutput::default(),
        }
    }

    fn gyro_was_turned_off(&mut self) {
        lock(&self.0).turned_off.push("gyro");
    }

    fn accel_was_turned_off(&mut self) {
        lock(&self.0).turned_off.push("accel");
    }

    fn compass_was_turned_off(&mut self) {
        lock(&self.0).turned_off.push("compass");
    }

    fn quaternion_was_turned_off(&mut self) {
        lock(&self.0).turned_off.push("quat");
    }

    fn load_calibration(&mut self) -> Result<()> {
        if lock(&self.0).load_fails {
            return Err(HalError::Calibration("no calibration file".into()));
        }
        Ok(())
    }

    fn store_calibration(&mut self) -> Result<()> {
        lock(&self.0).stores += 1;
        Ok(())
    }

    fn gyro_bias(&self) -> [i64; 3] {
        lock(&self.0).gyro_bias
    }

    fn gyro_sensitivity(&self) -> i64 {
        lock(&self.0).gyro_sensitivity
    }

    fn gyro_bias_dmp_units(&self) -> [i64; 3] {
        lock(&self.0).gyro_bias_dmp
    }

    fn accel_bias(&self) -> [i64; 3] {
        lock(&self.0).accel_bias
    }

    fn accel_accuracy(&self) -> i32 {
        lock(&self.0).accel_accuracy
    }

    fn compass_bias(&self) -> [i64; 3] {
        lock(&self.0).compass_bias
    }

    fn compass_sensitivity(&self) -> i64 {
        lock(&self.0).compass_sensitivity
    }

    fn compass_accuracy(&self) -> i32 {
        lock(&self.0).compass_accuracy
    }

    fn factory_gyro_bias(&self) -> [i64; 3] {
        lock(&self.0).factory_gyro_bias
    }

    fn factory_accel_bias(&self) -> [i64; 3] {
        lock(&self.0).factory_accel_bias
    }

    fn six_axis_quaternion(&self) -> [i32; 4] {
        lock(&self.0).six_quat
    }
}

// -- assembled HAL --

pub(crate) struct Rig {
    pub hal: MotionHal,
    pub sysfs: SysfsProbe,
    pub fusion: FusionProbe,
    pub gyro: SensorProbe,
    pub gyro_temp: SensorProbe,
    pub accel: SensorProbe,
    pub compass: SensorProbe,
    pub pressure: SensorProbe,
}

impl Rig {
    /// A HAL with every engine attached and no DMP image.
    pub fn new() -> Rig {
        Rig::with(|_, _| {})
    }

    /// A HAL with the DMP image loaded and running.
    pub fn with_dmp() -> Rig {
        let mut rig = Rig::with(|sysfs, _| sysfs.set(Attr::FirmwareLoaded, 1));
        rig.hal.load_dmp(&[0xAA; 16]).unwrap();
        rig.clear();
        rig
    }

    pub fn with(setup: impl FnOnce(&SysfsProbe, &FusionProbe)) -> Rig {
        let _ = env_logger::builder().is_test(true).try_init();
        let (sysfs, sysfs_probe) = MemSysfs::new();
        sysfs_probe.set_string(Attr::Part, "mpu6515");
        let (fusion, fusion_probe) = FakeFusion::new();
        setup(&sysfs_probe, &fusion_probe);

        let (gyro, gyro_probe) = FakeSensor::new(Engine::Gyro);
        let (gyro_temp, gyro_temp_probe) = FakeSensor::new(Engine::Gyro);
        let (accel, accel_probe) = FakeSensor::new(Engine::Accel);
        let (compass, compass_probe) = FakeSensor::new(Engine::Compass);
        let (pressure, pressure_probe) = FakeSensor::new(Engine::Pressure);
        let engines = Engines {
            gyro: Some(Box::new(gyro)),
            gyro_temp: Some(Box::new(gyro_temp)),
            accel: Some(Box::new(accel)),
            compass: Some(Box::new(compass)),
            pressure: Some(Box::new(pressure)),
        };

        let hal = MotionHal::new(HalConfig::default(), Box::new(sysfs), engines, Box::new(fusion))
            .unwrap();
        let rig = Rig {
            hal,
            sysfs: sysfs_probe,
            fusion: fusion_probe,
            gyro: gyro_probe,
            gyro_temp: gyro_temp_probe,
            accel: accel_probe,
            compass: compass_probe,
            pressure: pressure_probe,
        };
        rig.clear();
        rig
    }

    /// Forget construction-time calls.
    pub fn clear(&self) {
        self.sysfs.clear_writes();
        for probe in [&self.gyro, &self.gyro_temp, &self.accel, &self.compass, &self.pressure] {
            probe.clear();
        }
        let mut f = self.fusion.state();
        f.builds.clear();
        f.turned_off.clear();
        f.stores = 0;
    }
}
