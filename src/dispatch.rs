//! Event production: FIFO and adapter ingestion, per-kind handlers, flush
//! bookkeeping, and the polled step counter / significant motion reads.

use std::time::Duration;

use crate::adapter::AdapterEvent;
use crate::fusion::FusionMessage;
use crate::protocol::{Outcome, Sample, DATA_FORMAT_STEP};
use crate::sysfs::Attr;
use crate::types::{
    Engine, EngineMask, Event, EventData, Features, SensorEvent, SensorKind, SensorMask,
};
use crate::{HalError, MotionHal, Result};

/// Minimum spacing of die temperature reads while streaming gyro.
const TEMP_READ_INTERVAL_NS: i64 = 500_000_000;

/// Outstanding flush requests.
#[derive(Debug, Default)]
pub(crate) struct FlushState {
    /// Engines that still owe an acknowledgement, per kind.
    needed: [EngineMask; SensorKind::COUNT],
    /// Acknowledgements seen since the last settle.
    done: EngineMask,
    /// Kinds whose flush is complete and not yet reported.
    pending: SensorMask,
}

/// Engines a flush of `kind` has to go through.
fn flush_fanout(kind: SensorKind) -> EngineMask {
    match kind {
        SensorKind::Gyro | SensorKind::RawGyro => EngineMask::GYRO,
        SensorKind::Accelerometer => EngineMask::ACCEL,
        SensorKind::MagneticField | SensorKind::RawMagneticField => EngineMask::COMPASS,
        SensorKind::Pressure => EngineMask::PRESSURE,
        SensorKind::Orientation
        | SensorKind::RotationVector
        | SensorKind::LinearAccel
        | SensorKind::Gravity => EngineMask::FUSION,
        SensorKind::GameRotationVector => EngineMask::ACCEL | EngineMask::GYRO,
        SensorKind::GeomagneticRotationVector => EngineMask::ACCEL | EngineMask::COMPASS,
        SensorKind::SignificantMotion | SensorKind::StepDetector | SensorKind::StepCounter => {
            EngineMask::empty()
        }
    }
}

fn vector3(values: [f32; 5]) -> [f32; 3] {
    [values[0], values[1], values[2]]
}

impl MotionHal {
    // -- ingestion --

    /// Decode a chunk read from the FIFO and feed its samples to fusion.
    ///
    /// A partial trailing packet is kept for the next call.
    pub fn feed_fifo(&mut self, bytes: &[u8]) -> Outcome {
        let decoded = self.decoder.decode(bytes);
        let mut fresh_step = false;

        for sample in &decoded.samples {
            if self.config.log.input_data {
                log::trace!("fifo {:?}", sample);
            }
            match *sample {
                Sample::Gyro { raw, timestamp } => {
                    self.fusion.build_gyro(raw.map(i32::from), timestamp);
                    if !self.features.contains(Features::BATCH_MODE)
                        && timestamp - self.last_temp_timestamp >= TEMP_READ_INTERVAL_NS
                    {
                        self.last_temp_timestamp = timestamp;
                        self.read_gyro_temperature(timestamp);
                    }
                }
                Sample::Accel { raw, timestamp } => {
                    self.fusion.build_accel(raw.map(i32::from), timestamp)
                }
                Sample::Compass { raw, timestamp } => {
                    self.fusion.build_compass(raw.map(i32::from), timestamp)
                }
                Sample::Quat { kind, quat, timestamp } => {
                    let applied = self.bias.gyro.applied;
                    self.fusion.build_quat(kind, quat, applied, timestamp);
                }
                Sample::Pressure { value, timestamp } => {
                    if self.local.contains(EngineMask::PRESSURE) {
                        self.fusion.build_pressure(value, timestamp);
                        self.pressure_raw = value;
                        self.pressure_timestamp = timestamp;
                        self.pressure_update = true;
                    }
                }
                Sample::Step { timestamp, .. } => {
                    if timestamp > self.step_timestamp {
                        self.step_timestamp = timestamp;
                        fresh_step = true;
                    }
                }
            }
        }

        self.data_marker |= decoded.data_marker;
        self.empty_marker |= decoded.empty_marker;
        if fresh_step {
            self.ped_update |= decoded.ped_update;
        } else if decoded.ped_update != 0 {
            // only repeats of an already reported step
            self.ped_update = 0;
        }
        decoded.outcome
    }

    fn read_gyro_temperature(&mut self, timestamp: i64) {
        let Some(temp) = self.engines.gyro_temp.as_deref_mut() else {
            return;
        };
        match temp.read_raw() {
            Ok(raw) => {
                let celsius = ((raw as i64) << 16) as f64 * temp.scale() + temp.offset();
                self.fusion.build_temp(celsius as i64, timestamp);
            }
            Err(e) => log::warn!("Cannot read gyro temperature: {}", e),
        }
    }

    /// Pull pending events out of every adapter.
    ///
    /// Flush acknowledgements are matched against outstanding flush requests.
    pub fn poll_adapters(&mut self, max: usize) -> Result<usize> {
        let mut count = 0;

        for event in self.drain_adapter(Engine::Accel, max)? {
            count += 1;
            match event {
                AdapterEvent::Sample { values, timestamp } => {
                    self.fusion.build_accel(values, timestamp);
                    let quat = self.fusion.six_axis_quaternion();
                    if quat.iter().all(|q| *q != 0) {
                        self.initial_6quat = Some(quat);
                    }
                }
                AdapterEvent::FlushComplete => self.flush.done |= EngineMask::ACCEL,
            }
        }

        for event in self.drain_adapter(Engine::Gyro, max)? {
            count += 1;
            match event {
                AdapterEvent::Sample { values, timestamp } => self.fusion.build_gyro(values, timestamp),
                AdapterEvent::FlushComplete => self.flush.done |= EngineMask::GYRO,
            }
        }

        if let Some(temp) = self.engines.gyro_temp.as_deref_mut() {
            let events = temp.read_events(max)?;
            let (scale, offset) = (temp.scale(), temp.offset());
            for event in events {
                count += 1;
                if let AdapterEvent::Sample { values, timestamp } = event {
                    let celsius = ((values[0] as i64) << 16) as f64 * scale + offset;
                    self.fusion.build_temp(celsius as i64, timestamp);
                }
            }
        }

        for event in self.drain_adapter(Engine::Compass, max)? {
            count += 1;
            match event {
                AdapterEvent::Sample { values, timestamp } => {
                    if self.local.contains(EngineMask::COMPASS) {
                        self.fusion.build_compass(values, timestamp);
                    }
                }
                AdapterEvent::FlushComplete => self.flush.done |= EngineMask::COMPASS,
            }
        }

        for event in self.drain_adapter(Engine::Pressure, max)? {
            count += 1;
            match event {
                AdapterEvent::Sample { values, timestamp } => {
                    self.pressure_raw = values[0];
                    self.pressure_timestamp = timestamp;
                    self.pressure_update = true;
                }
                AdapterEvent::FlushComplete => self.flush.done |= EngineMask::PRESSURE,
            }
        }

        self.settle_flushes();
        Ok(count)
    }

    fn drain_adapter(&mut self, engine: Engine, max: usize) -> Result<Vec<AdapterEvent>> {
        match self.engines.get_mut(engine) {
            Some(sensor) => sensor.read_events(max),
            None => Ok(Vec::new()),
        }
    }

    fn settle_flushes(&mut self) {
        let done = std::mem::take(&mut self.flush.done);
        if done.is_empty() {
            return;
        }
        for kind in SensorKind::ALL {
            let needed = &mut self.flush.needed[kind.index()];
            if needed.is_empty() {
                continue;
            }
            needed.remove(done);
            if needed.is_empty() {
                self.flush.pending |= kind.bit();
            }
        }
    }

    // -- flush --

    /// Request a flush-complete marker for `kind`.
    ///
    /// The marker is reported by [`MotionHal::read_events`] once every engine
    /// behind `kind` has acknowledged, or right away when there is no FIFO to
    /// drain.
    pub fn flush(&mut self, kind: SensorKind) -> Result<()> {
        let enabled = match kind {
            SensorKind::StepDetector => self.pedometer_enabled,
            SensorKind::StepCounter => self.step_count_enabled,
            SensorKind::SignificantMotion => self.smd_enabled,
            _ => self.enabled.has(kind),
        };
        if !enabled {
            return Err(HalError::InvalidArgument(format!("flush of disabled {}", kind)));
        }

        let fanout = flush_fanout(kind);
        let depth = Engine::ALL
            .into_iter()
            .filter(|e| fanout.has(*e))
            .filter_map(|e| self.engines.get(e))
            .map(|s| s.descriptor().fifo_max_event_count)
            .max()
            .unwrap_or(0);
        if depth == 0 {
            self.flush.pending |= kind.bit();
            return Ok(());
        }

        let mut needed = EngineMask::empty();
        for engine in Engine::ALL.into_iter().filter(|e| fanout.has(*e)) {
            let Some(sensor) = self.engines.get_mut(engine) else {
                continue;
            };
            match sensor.flush() {
                Ok(()) => needed |= engine.mask(),
                Err(e) => log::error!("{} flush for {} failed: {}", engine, kind, e),
            }
        }

        if needed.is_empty() {
            self.flush.pending |= kind.bit();
        } else {
            self.flush.needed[kind.index()] |= needed;
        }
        if self.config.log.process {
            log::debug!("flush {} waiting on {:?}", kind, needed);
        }
        Ok(())
    }

    // -- dispatch --

    /// Produce up to `max` events from the latest fusion state.
    pub fn read_events(&mut self, max: usize) -> Vec<Event> {
        let mut events = Vec::new();

        for kind in SensorKind::ALL {
            if events.len() >= max {
                break;
            }
            if self.flush.pending.has(kind) {
                self.flush.pending.remove(kind.bit());
                events.push(Event::FlushComplete(kind));
            }
        }
        if events.len() >= max {
            return events;
        }

        self.drain_notifications();

        if self.data_marker || self.empty_marker {
            if self.data_marker && !self.empty_marker {
                // a data marker means the FIFO was reset under fusion
                self.fusion.gyro_was_turned_off();
                self.fusion.accel_was_turned_off();
                self.fusion.compass_was_turned_off();
                self.fusion.quaternion_was_turned_off();
            }
            self.data_marker = false;
            self.empty_marker = false;
            return events;
        }

        for kind in SensorKind::ALL {
            if events.len() >= max {
                break;
            }
            if self.ped_update != 0 {
                if kind == SensorKind::StepDetector {
                    if self.pedometer_enabled {
                        events.push(Event::Sensor(SensorEvent {
                            kind,
                            timestamp: self.step_timestamp,
                            data: EventData::Trigger,
                        }));
                    }
                    self.ped_update = 0;
                    continue;
                }
                if self.ped_update == DATA_FORMAT_STEP {
                    continue;
                }
            }
            if !self.enabled.has(kind) {
                continue;
            }
            if let Some(event) = self.handle(kind) {
                if self.config.log.handler_data {
                    log::debug!("{} {:?}", kind, event);
                }
                events.push(Event::Sensor(event));
            }
        }
        events
    }

    fn drain_notifications(&mut self) {
        for msg in self.notifications.drain() {
            if self.config.log.extra {
                log::debug!("fusion notice {:?}", msg);
            }
            match msg {
                FusionMessage::NoMotion => self.have_good_mpu_cal = true,
                FusionMessage::NewAccelBias => {
                    self.bias.accel.update(self.fusion.accel_bias());
                    self.accel_accuracy = self.fusion.accel_accuracy();
                }
                FusionMessage::NewGyroBias => {
                    self.refresh_gyro_bias();
                    self.apply_gyro_bias();
                }
                FusionMessage::NewFactoryGyroBias => {
                    self.bias.factory_gyro.update(self.fusion.factory_gyro_bias());
                }
                FusionMessage::NewFactoryAccelBias => {
                    self.bias.factory_accel.update(self.fusion.factory_accel_bias());
                }
                FusionMessage::NewCompassBias => {
                    self.refresh_compass_bias();
                    self.compass_accuracy = self.fusion.compass_accuracy();
                }
            }
        }
    }

    /// Fused output for one enabled kind, if it produced something new.
    fn handle(&mut self, kind: SensorKind) -> Option<SensorEvent> {
        let event = |timestamp, data| Some(SensorEvent { kind, timestamp, data });

        match kind {
            SensorKind::Pressure => {
                if !self.pressure_update {
                    return None;
                }
                self.pressure_update = false;
                event(
                    self.pressure_timestamp,
                    EventData::Pressure(self.pressure_raw as f32 / 100.0),
                )
            }
            k if k.is_dmp_only() => None,
            _ => {
                let out = self.fusion.output(kind);
                let compass_idle = !self.engines.has_compass() || !self.active().has(Engine::Compass);
                let updated = match kind {
                    SensorKind::RotationVector
                    | SensorKind::LinearAccel
                    | SensorKind::Gravity
                    | SensorKind::Orientation => out.updated || compass_idle,
                    _ => out.updated,
                };
                if !updated {
                    return None;
                }

                let data = match kind {
                    SensorKind::Accelerometer => {
                        self.accel_accuracy = self.fusion.accel_accuracy();
                        EventData::Vector { values: vector3(out.values), status: out.status }
                    }
                    SensorKind::MagneticField => {
                        self.compass_accuracy = self.fusion.compass_accuracy();
                        EventData::Vector { values: vector3(out.values), status: out.status }
                    }
                    SensorKind::RawGyro => EventData::Uncalibrated {
                        values: vector3(out.values),
                        bias: self.bias.gyro.values,
                    },
                    SensorKind::RawMagneticField => EventData::Uncalibrated {
                        values: vector3(out.values),
                        bias: self.bias.compass.values,
                    },
                    SensorKind::RotationVector
                    | SensorKind::GameRotationVector
                    | SensorKind::GeomagneticRotationVector => {
                        EventData::Rotation { values: out.values, status: out.status }
                    }
                    _ => EventData::Vector { values: vector3(out.values), status: out.status },
                };
                event(out.timestamp, data)
            }
        }
    }

    // -- polled DMP events --

    /// Whether the step counter is due for another read.
    pub fn has_step_count_pending(&mut self) -> bool {
        if !self.step_count_enabled {
            return false;
        }
        let Some(period) = self.step_poll_ns else {
            return false;
        };
        if self.last_step_poll.elapsed() >= Duration::from_nanos(period.max(0) as u64) {
            self.last_step_poll = std::time::Instant::now();
            return true;
        }
        false
    }

    /// Read the DMP step counter, reporting only changed counts.
    pub fn read_step_counter(&mut self) -> Result<Option<Event>> {
        if !self.step_count_enabled {
            return Ok(None);
        }
        let steps = self.sysfs.read_int(Attr::PedometerSteps)?.max(0) as u64;
        if steps == self.last_step_count {
            return Ok(None);
        }
        self.last_step_count = steps;
        let timestamp = self.sysfs.read_int(Attr::PedometerCounter)?;
        Ok(Some(Event::Sensor(SensorEvent {
            kind: SensorKind::StepCounter,
            timestamp,
            data: EventData::StepCount(steps),
        })))
    }

    /// Consume a significant motion interrupt. The sensor disarms itself after
    /// one trigger.
    pub fn read_significant_motion(&mut self) -> Result<Option<Event>> {
        let fired = self.sysfs.read_int(Attr::EventSmd)?;
        if !self.smd_enabled {
            return Ok(None);
        }
        if self.config.log.process {
            log::debug!("significant motion {}", fired);
        }
        self.smd_enabled = false;
        self.features.remove(Features::SIGNIFICANT_MOTION);
        Ok(Some(Event::Sensor(SensorEvent {
            kind: SensorKind::SignificantMotion,
            timestamp: self.now_ns(),
            data: EventData::Trigger,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionRate;
    use crate::protocol::tests::{quat_packet, vector_packet};
    use crate::protocol::{
        QuatKind, DATA_FORMAT_ACCEL, DATA_FORMAT_EMPTY_MARKER, DATA_FORMAT_GYRO, DATA_FORMAT_MARKER,
        DATA_FORMAT_PRESSURE, DATA_FORMAT_QUAT,
    };
    use crate::testing::{Build, Rig};
    use crate::types::Status;

    fn marker(tag: u16) -> Vec<u8> {
        let mut p = tag.to_le_bytes().to_vec();
        p.resize(8, 0);
        p
    }

    fn flushes(events: &[Event]) -> Vec<SensorKind> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::FlushComplete(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_grv_flush_waits_for_both_engines() {
        for accel_first in [true, false] {
            let mut rig = Rig::new();
            let grv = SensorKind::GameRotationVector;
            rig.hal.enable(grv, true).unwrap();
            rig.hal.flush(grv).unwrap();
            assert_eq!(rig.accel.flushes(), 1);
            assert_eq!(rig.gyro.flushes(), 1);
            assert_eq!(rig.compass.flushes(), 0);

            let (first, second) = if accel_first {
                (&rig.accel, &rig.gyro)
            } else {
                (&rig.gyro, &rig.accel)
            };
            first.push(AdapterEvent::FlushComplete);
            assert_eq!(rig.hal.poll_adapters(16).unwrap(), 1);
            assert!(flushes(&rig.hal.read_events(16)).is_empty());

            second.push(AdapterEvent::FlushComplete);
            rig.hal.poll_adapters(16).unwrap();
            assert_eq!(flushes(&rig.hal.read_events(16)), vec![grv]);
            assert!(flushes(&rig.hal.read_events(16)).is_empty());
        }
    }

    #[test]
    fn test_flush_rejects_disabled_kind() {
        let mut rig = Rig::new();
        assert!(matches!(
            rig.hal.flush(SensorKind::Gyro),
            Err(HalError::InvalidArgument(_))
        ));
        assert_eq!(rig.gyro.flushes(), 0);
    }

    #[test]
    fn test_flush_without_fifo_completes_immediately() {
        let mut rig = Rig::with_dmp();
        rig.hal.enable(SensorKind::StepCounter, true).unwrap();
        rig.hal.flush(SensorKind::StepCounter).unwrap();
        assert_eq!(flushes(&rig.hal.read_events(4)), vec![SensorKind::StepCounter]);
    }

    #[test]
    fn test_failed_engine_flush_completes_immediately() {
        let mut rig = Rig::new();
        rig.hal.enable(SensorKind::Accelerometer, true).unwrap();
        rig.accel.state().fail_flush = true;
        rig.hal.flush(SensorKind::Accelerometer).unwrap();
        assert_eq!(flushes(&rig.hal.read_events(4)), vec![SensorKind::Accelerometer]);
    }

    #[test]
    fn test_one_ack_serves_every_waiting_kind() {
        let mut rig = Rig::new();
        rig.hal.enable(SensorKind::Gyro, true).unwrap();
        rig.hal.enable(SensorKind::RawGyro, true).unwrap();
        rig.hal.flush(SensorKind::Gyro).unwrap();
        rig.hal.flush(SensorKind::RawGyro).unwrap();
        rig.gyro.push(AdapterEvent::FlushComplete);
        rig.hal.poll_adapters(16).unwrap();
        assert_eq!(
            flushes(&rig.hal.read_events(16)),
            vec![SensorKind::Gyro, SensorKind::RawGyro]
        );
    }

    #[test]
    fn test_fifo_samples_reach_fusion() {
        let mut rig = Rig::new();
        rig.hal.enable(SensorKind::Accelerometer, true).unwrap();
        let mut bytes = vector_packet(DATA_FORMAT_ACCEL, [1, -2, 3], 1_000);
        bytes.extend(quat_packet(DATA_FORMAT_QUAT, [10, 20, 30], 2_000));
        assert_eq!(rig.hal.feed_fifo(&bytes), Outcome::Complete);
        assert_eq!(
            rig.fusion.builds(),
            vec![
                Build::Accel([1, -2, 3], 1_000),
                Build::Quat(QuatKind::ThreeAxis, [10, 20, 30], false, 2_000),
            ]
        );

        rig.fusion.set_output(SensorKind::Accelerometer, [0.1, 0.2, 9.8, 0.0, 0.0]);
        let events = rig.hal.read_events(8);
        assert_eq!(
            events,
            vec![Event::Sensor(SensorEvent {
                kind: SensorKind::Accelerometer,
                timestamp: 1_000,
                data: EventData::Vector { values: [0.1, 0.2, 9.8], status: Status::High },
            })]
        );
        assert!(rig.hal.read_events(8).is_empty(), "stale output is not repeated");
    }

    #[test]
    fn test_partial_packet_carries_over() {
        let mut rig = Rig::new();
        let packet = vector_packet(DATA_FORMAT_GYRO, [4, 5, 6], 600_000_000);
        assert_eq!(rig.hal.feed_fifo(&packet[..10]), Outcome::NeedMore(10));
        assert!(rig.fusion.builds().is_empty());
        rig.hal.feed_fifo(&packet[10..]);
        let builds = rig.fusion.builds();
        assert_eq!(builds[0], Build::Gyro([4, 5, 6], 600_000_000));
        // first gyro sample past the interval also samples die temperature
        assert!(matches!(builds[1], Build::Temp(_, 600_000_000)));
    }

    #[test]
    fn test_marker_resets_fusion_inputs() {
        let mut rig = Rig::new();
        rig.hal.enable(SensorKind::Accelerometer, true).unwrap();
        rig.fusion.state().turned_off.clear();
        rig.fusion.set_output(SensorKind::Accelerometer, [1.0; 5]);

        rig.hal.feed_fifo(&marker(DATA_FORMAT_MARKER));
        assert!(rig.hal.read_events(8).is_empty());
        assert_eq!(rig.fusion.state().turned_off, vec!["gyro", "accel", "compass", "quat"]);
        assert_eq!(rig.hal.read_events(8).len(), 1);

        rig.fusion.state().turned_off.clear();
        rig.hal.feed_fifo(&marker(DATA_FORMAT_EMPTY_MARKER));
        assert!(rig.hal.read_events(8).is_empty());
        assert!(rig.fusion.state().turned_off.is_empty());
    }

    #[test]
    fn test_step_detector_reports_new_steps_only() {
        let mut rig = Rig::with_dmp();
        rig.hal.enable(SensorKind::StepDetector, true).unwrap();
        let step = vector_packet(DATA_FORMAT_STEP, [0; 3], 5_000);

        rig.hal.feed_fifo(&step);
        let events = rig.hal.read_events(8);
        assert_eq!(
            events,
            vec![Event::Sensor(SensorEvent {
                kind: SensorKind::StepDetector,
                timestamp: 5_000,
                data: EventData::Trigger,
            })]
        );

        rig.hal.feed_fifo(&step);
        assert!(rig.hal.read_events(8).is_empty());
    }

    #[test]
    fn test_step_survives_later_chunks() {
        let mut rig = Rig::with_dmp();
        rig.hal.enable(SensorKind::StepDetector, true).unwrap();
        rig.hal.feed_fifo(&vector_packet(DATA_FORMAT_STEP, [0; 3], 5_000));
        rig.hal.feed_fifo(&vector_packet(DATA_FORMAT_ACCEL, [1, 2, 3], 6_000));
        rig.hal.feed_fifo(&vector_packet(DATA_FORMAT_GYRO, [1, 2, 3], 7_000));

        let steps: Vec<_> = rig
            .hal
            .read_events(8)
            .into_iter()
            .filter(|e| e.kind() == SensorKind::StepDetector)
            .collect();
        assert_eq!(
            steps,
            vec![Event::Sensor(SensorEvent {
                kind: SensorKind::StepDetector,
                timestamp: 5_000,
                data: EventData::Trigger,
            })]
        );
        assert_eq!(rig.hal.ped_update, 0);
    }

    #[test]
    fn test_fifo_pressure_reaches_fusion_and_events() {
        let mut rig = Rig::new();
        rig.hal.enable(SensorKind::Pressure, true).unwrap();
        let packet = vector_packet(DATA_FORMAT_PRESSURE, [0, 1, 100], 7_000);
        assert_eq!(rig.hal.feed_fifo(&packet), Outcome::Complete);
        assert_eq!(rig.fusion.builds(), vec![Build::Pressure(0x1_0064, 7_000)]);

        let events = rig.hal.read_events(8);
        assert_eq!(
            events,
            vec![Event::Sensor(SensorEvent {
                kind: SensorKind::Pressure,
                timestamp: 7_000,
                data: EventData::Pressure(0x1_0064 as f32 / 100.0),
            })]
        );
    }

    #[test]
    fn test_fifo_pressure_ignored_while_disabled() {
        let mut rig = Rig::new();
        rig.hal.feed_fifo(&vector_packet(DATA_FORMAT_PRESSURE, [0, 1, 100], 7_000));
        assert!(rig.fusion.builds().is_empty());
    }

    #[test]
    fn test_flush_events_filling_max_keep_marker() {
        let mut rig = Rig::new();
        rig.hal.enable(SensorKind::Accelerometer, true).unwrap();
        rig.accel.state().fail_flush = true;
        rig.hal.flush(SensorKind::Accelerometer).unwrap();
        rig.fusion.state().turned_off.clear();
        rig.hal.feed_fifo(&marker(DATA_FORMAT_MARKER));

        let events = rig.hal.read_events(1);
        assert_eq!(flushes(&events), vec![SensorKind::Accelerometer]);
        assert!(rig.fusion.state().turned_off.is_empty());

        assert!(rig.hal.read_events(8).is_empty());
        assert_eq!(rig.fusion.state().turned_off, vec!["gyro", "accel", "compass", "quat"]);
    }

    #[test]
    fn test_significant_motion_is_one_shot() {
        let mut rig = Rig::with_dmp();
        rig.hal.enable(SensorKind::SignificantMotion, true).unwrap();
        rig.sysfs.set(Attr::EventSmd, 1);

        let event = rig.hal.read_significant_motion().unwrap().unwrap();
        assert_eq!(event.kind(), SensorKind::SignificantMotion);
        assert!(!rig.hal.smd_enabled);
        assert!(!rig.hal.features().contains(Features::SIGNIFICANT_MOTION));
        assert_eq!(rig.hal.read_significant_motion().unwrap(), None);
    }

    #[test]
    fn test_step_counter_reports_changes() {
        let mut rig = Rig::with_dmp();
        assert_eq!(rig.hal.read_step_counter().unwrap(), None);
        rig.hal.enable(SensorKind::StepCounter, true).unwrap();
        rig.sysfs.set(Attr::PedometerSteps, 5);
        rig.sysfs.set(Attr::PedometerCounter, 777);

        let expected = Event::Sensor(SensorEvent {
            kind: SensorKind::StepCounter,
            timestamp: 777,
            data: EventData::StepCount(5),
        });
        assert_eq!(rig.hal.read_step_counter().unwrap(), Some(expected));
        assert_eq!(rig.hal.read_step_counter().unwrap(), None);

        rig.sysfs.set(Attr::PedometerSteps, 6);
        assert!(matches!(
            rig.hal.read_step_counter().unwrap(),
            Some(Event::Sensor(SensorEvent { data: EventData::StepCount(6), .. }))
        ));
    }

    #[test]
    fn test_step_poll_interval() {
        let mut rig = Rig::with_dmp();
        assert!(!rig.hal.has_step_count_pending());
        rig.hal.enable(SensorKind::StepCounter, true).unwrap();
        rig.hal.set_delay(SensorKind::StepCounter, 0).unwrap();
        // clamped to 5 ms
        std::thread::sleep(std::time::Duration::from_millis(6));
        assert!(rig.hal.has_step_count_pending());
    }

    #[test]
    fn test_adapter_pressure_in_hpa() {
        let mut rig = Rig::new();
        rig.hal.enable(SensorKind::Pressure, true).unwrap();
        rig.pressure.push(AdapterEvent::Sample { values: [101_325, 0, 0], timestamp: 42 });
        rig.hal.poll_adapters(8).unwrap();
        let events = rig.hal.read_events(8);
        assert_eq!(
            events,
            vec![Event::Sensor(SensorEvent {
                kind: SensorKind::Pressure,
                timestamp: 42,
                data: EventData::Pressure(1013.25),
            })]
        );
    }

    #[test]
    fn test_adapter_accel_caches_six_axis_quaternion() {
        let mut rig = Rig::new();
        rig.fusion.state().six_quat = [1, 2, 3, 4];
        rig.accel.push(AdapterEvent::Sample { values: [1, 2, 3], timestamp: 7 });
        rig.hal.poll_adapters(8).unwrap();
        assert_eq!(rig.hal.initial_6quat, Some([1, 2, 3, 4]));

        rig.hal.initial_6quat = None;
        rig.fusion.state().six_quat = [1, 0, 3, 4];
        rig.accel.push(AdapterEvent::Sample { values: [1, 2, 3], timestamp: 8 });
        rig.hal.poll_adapters(8).unwrap();
        assert_eq!(rig.hal.initial_6quat, None);
    }

    #[test]
    fn test_notifications_update_bias_state() {
        let mut rig = Rig::new();
        {
            let mut f = rig.fusion.state();
            f.accel_bias = [100, 200, 300];
            f.accel_accuracy = 3;
            f.gyro_bias = [65536, 0, 0];
            f.gyro_bias_dmp = [7, 8, 9];
        }
        let notifier = rig.hal.notifier();
        notifier.notify(FusionMessage::NoMotion).unwrap();
        notifier.notify(FusionMessage::NewAccelBias).unwrap();
        notifier.notify(FusionMessage::NewGyroBias).unwrap();
        rig.hal.read_events(8);

        assert!(rig.hal.have_good_mpu_cal);
        assert_eq!(rig.hal.accel_accuracy, 3);
        assert_eq!(rig.hal.bias.accel.values, [100, 200, 300]);
        assert!(rig.hal.bias.gyro.applied);
        assert_eq!(rig.sysfs.writes_to(Attr::GyroXDmpBias), vec![7]);
    }

    #[test]
    fn test_uncalibrated_gyro_carries_bias() {
        let mut rig = Rig::new();
        rig.hal.enable(SensorKind::RawGyro, true).unwrap();
        rig.hal.bias.gyro.values = [0.5, 0.0, -0.5];
        rig.fusion.set_output(SensorKind::RawGyro, [1.0, 2.0, 3.0, 0.0, 0.0]);
        let events = rig.hal.read_events(8);
        assert!(matches!(
            events[0],
            Event::Sensor(SensorEvent {
                data: EventData::Uncalibrated { bias: [0.5, 0.0, -0.5], .. },
                ..
            })
        ));
        assert_eq!(rig.fusion.rate(FusionRate::Gyro), Some(1_000_000));
    }
}
