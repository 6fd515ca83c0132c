use std::fmt;

use crate::sysfs::Attr;
use crate::types::Engine;

/// Errors raised by the HAL core.
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown sensor handle {0}")]
    UnknownSensor(i32),

    #[error("sysfs I/O on {attr}: {source}")]
    Io {
        attr: Attr,
        #[source]
        source: std::io::Error,
    },

    #[error("sysfs error: {0}")]
    Sysfs(String),

    #[error("{engine} adapter failed with code {code}")]
    Adapter { engine: Engine, code: i32 },

    #[error("No DMP image loaded")]
    DmpNotLoaded,

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Fusion notification channel disconnected")]
    ChannelDisconnected,
}

impl HalError {
    pub(crate) fn adapter(engine: Engine, code: i32) -> Self {
        HalError::Adapter { engine, code }
    }

    /// Negative errno equivalent, as returned through the C ABI.
    pub fn errno(&self) -> i32 {
        match self {
            HalError::InvalidArgument(_) | HalError::UnknownSensor(_) => -22,
            HalError::Io { source, .. } => source.raw_os_error().map_or(-5, |e| -e),
            HalError::Sysfs(_) | HalError::Calibration(_) => -5,
            HalError::Adapter { code, .. } if *code < 0 => *code,
            HalError::Adapter { .. } => -5,
            HalError::DmpNotLoaded => -19,
            HalError::ChannelDisconnected => -32,
        }
    }
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &HalError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
