//! C FFI layer for motionhal.
//!
//! Provides an opaque handle-based API for the native sensor service.
//! The generated C header is written to `include/motionhal.h` by cbindgen.

use crate::engine::MotionHal;
use crate::error::LastError;
use crate::types::{Event, EventData, SensorKind};
use crate::{HalError, Result};
use std::ffi::c_int;
use std::sync::{Mutex, MutexGuard};

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque HAL handle for C consumers.
pub struct MhHal(Mutex<MotionHal>);

impl MhHal {
    /// Hand a fully wired HAL over to C. Release it with `mh_close`.
    pub fn into_raw(hal: MotionHal) -> *mut MhHal {
        Box::into_raw(Box::new(MhHal(Mutex::new(hal))))
    }
}

/// One event in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MhEvent {
    /// Sensor handle (kind index + 1).
    pub kind: i32,
    /// 1 for a flush-complete meta event, 0 for data.
    pub meta: i32,
    /// Nanoseconds.
    pub timestamp: i64,
    /// Values; uncalibrated events carry the bias in `data[3..6]`.
    pub data: [f32; 6],
    /// 0 unreliable .. 3 high.
    pub status: i32,
    pub step_count: u64,
}

impl From<&Event> for MhEvent {
    fn from(event: &Event) -> Self {
        let mut out = MhEvent {
            kind: event.kind().handle(),
            ..MhEvent::default()
        };
        let ev = match event {
            Event::FlushComplete(_) => {
                out.meta = 1;
                return out;
            }
            Event::Sensor(ev) => ev,
        };
        out.timestamp = ev.timestamp;
        out.status = ev.data.status() as i32;
        match ev.data {
            EventData::Vector { values, .. } => out.data[..3].copy_from_slice(&values),
            EventData::Uncalibrated { values, bias } => {
                out.data[..3].copy_from_slice(&values);
                out.data[3..].copy_from_slice(&bias);
            }
            EventData::Rotation { values, .. } => out.data[..5].copy_from_slice(&values),
            EventData::Pressure(hpa) => out.data[0] = hpa,
            EventData::Trigger => out.data[0] = 1.0,
            EventData::StepCount(steps) => out.step_count = steps,
        }
        out
    }
}

unsafe fn lock<'a>(hal: *const MhHal) -> Option<MutexGuard<'a, MotionHal>> {
    if hal.is_null() {
        LAST_ERROR.set(&HalError::InvalidArgument("null HAL handle".into()));
        return None;
    }
    Some((*hal).0.lock().unwrap_or_else(|e| e.into_inner()))
}

fn kind_of(handle: c_int) -> Result<SensorKind> {
    SensorKind::from_handle(handle).ok_or(HalError::UnknownSensor(handle))
}

fn status(result: Result<()>) -> c_int {
    match result {
        Ok(()) => {
            LAST_ERROR.clear();
            0
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            e.errno()
        }
    }
}

/// Enable (`en != 0`) or disable a sensor.
/// Returns 0 or a negative errno.
///
/// # Safety
/// `hal` must be a pointer returned by `MhHal::into_raw`, or null.
#[no_mangle]
pub unsafe extern "C" fn mh_enable(hal: *mut MhHal, handle: c_int, en: c_int) -> c_int {
    let Some(mut hal) = lock(hal) else {
        return -22;
    };
    status(kind_of(handle).and_then(|kind| hal.enable(kind, en != 0)))
}

/// Set the sampling period of a sensor in nanoseconds.
///
/// # Safety
/// `hal` must be a pointer returned by `MhHal::into_raw`, or null.
#[no_mangle]
pub unsafe extern "C" fn mh_set_delay(hal: *mut MhHal, handle: c_int, period_ns: i64) -> c_int {
    let Some(mut hal) = lock(hal) else {
        return -22;
    };
    status(kind_of(handle).and_then(|kind| hal.set_delay(kind, period_ns)))
}

/// Configure batching for a sensor.
///
/// # Safety
/// `hal` must be a pointer returned by `MhHal::into_raw`, or null.
#[no_mangle]
pub unsafe extern "C" fn mh_batch(
    hal: *mut MhHal,
    handle: c_int,
    flags: c_int,
    period_ns: i64,
    timeout_ns: i64,
) -> c_int {
    let Some(mut hal) = lock(hal) else {
        return -22;
    };
    let result = kind_of(handle).and_then(|kind| hal.batch(kind, flags, period_ns, timeout_ns));
    status(result.map(|outcome| log::debug!("batch {}: {:?}", handle, outcome)))
}

/// Request a flush-complete event for a sensor.
///
/// # Safety
/// `hal` must be a pointer returned by `MhHal::into_raw`, or null.
#[no_mangle]
pub unsafe extern "C" fn mh_flush(hal: *mut MhHal, handle: c_int) -> c_int {
    let Some(mut hal) = lock(hal) else {
        return -22;
    };
    status(kind_of(handle).and_then(|kind| hal.flush(kind)))
}

/// Feed `len` bytes read from the DMP FIFO.
/// Returns 0, or -1 when the chunk held a malformed packet and was dropped.
///
/// # Safety
/// `hal` must be a valid HAL pointer, or null. `bytes` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn mh_feed_fifo(hal: *mut MhHal, bytes: *const u8, len: usize) -> c_int {
    if bytes.is_null() {
        return -22;
    }
    let Some(mut hal) = lock(hal) else {
        return -22;
    };
    let chunk = std::slice::from_raw_parts(bytes, len);
    match hal.feed_fifo(chunk) {
        crate::protocol::Outcome::Corrupt(_) => -1,
        _ => 0,
    }
}

/// Drain adapter events, then write up to `max` events into `out`.
/// Returns the number of events written, or -1 on error.
///
/// # Safety
/// `hal` must be a valid HAL pointer, or null. `out` must point to an array of at
/// least `max` `MhEvent` elements.
#[no_mangle]
pub unsafe extern "C" fn mh_read_events(hal: *mut MhHal, out: *mut MhEvent, max: c_int) -> c_int {
    if out.is_null() || max < 0 {
        return -1;
    }
    let Some(mut hal) = lock(hal) else {
        return -1;
    };
    let max = max as usize;
    if let Err(e) = hal.poll_adapters(max) {
        LAST_ERROR.set(&e);
        return -1;
    }
    let events = hal.read_events(max);
    for (i, event) in events.iter().enumerate() {
        out.add(i).write(MhEvent::from(event));
    }
    events.len() as c_int
}

/// Close the HAL and free its resources.
///
/// # Safety
/// `hal` must be a pointer returned by `MhHal::into_raw`, or null.
#[no_mangle]
pub unsafe extern "C" fn mh_close(hal: *mut MhHal) {
    if !hal.is_null() {
        drop(Box::from_raw(hal));
    }
}

/// Get the last error message. Returns NULL if the last call succeeded.
/// The returned pointer is valid until the next motionhal API call.
#[no_mangle]
pub extern "C" fn mh_last_error() -> *const std::ffi::c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterEvent;
    use crate::testing::Rig;
    use crate::types::Status;

    #[test]
    fn test_handle_lifecycle() {
        let rig = Rig::new();
        let hal = MhHal::into_raw(rig.hal);
        let accel = SensorKind::Accelerometer.handle();
        unsafe {
            assert_eq!(mh_enable(hal, accel, 1), 0);
            assert_eq!(mh_set_delay(hal, accel, 20_000_000), 0);
            assert_eq!(mh_enable(hal, 99, 1), -22);
            assert_eq!(mh_flush(hal, accel), 0);

            rig.accel.push(AdapterEvent::FlushComplete);
            let mut out = [MhEvent::default(); 4];
            assert_eq!(mh_read_events(hal, out.as_mut_ptr(), 4), 1);
            assert_eq!(out[0].kind, accel);
            assert_eq!(out[0].meta, 1);
            mh_close(hal);
        }
        assert_eq!(rig.accel.last_delay(), Some(20_000_000));
    }

    #[test]
    fn test_null_handles_are_rejected() {
        unsafe {
            assert_eq!(mh_enable(std::ptr::null_mut(), 1, 1), -22);
            assert!(!mh_last_error().is_null());
            assert_eq!(mh_read_events(std::ptr::null_mut(), std::ptr::null_mut(), 1), -1);
            mh_close(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_event_layout() {
        let event = Event::Sensor(crate::types::SensorEvent {
            kind: SensorKind::RawGyro,
            timestamp: 9,
            data: EventData::Uncalibrated { values: [1.0, 2.0, 3.0], bias: [0.1, 0.2, 0.3] },
        });
        let c = MhEvent::from(&event);
        assert_eq!(c.kind, 2);
        assert_eq!(c.meta, 0);
        assert_eq!(c.data, [1.0, 2.0, 3.0, 0.1, 0.2, 0.3]);
        assert_eq!(c.status, Status::Unreliable as i32);
    }
}
