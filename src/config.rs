//! Runtime configuration and log categories.

use std::path::PathBuf;

pub const DEFAULT_IIO_PATH: &str = "/sys/bus/iio/devices/iio:device0";
pub const DEFAULT_SMD_THRESHOLD: i64 = 3000;

/// Per-category debug output switches.
///
/// Errors and warnings are always logged; these only gate `debug!`/`trace!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogConfig {
    /// Call flow through enable/batch/rate changes.
    pub process: bool,
    pub extra: bool,
    /// Every attribute write.
    pub sysfs: bool,
    /// Decoded FIFO samples.
    pub input_data: bool,
    /// Events leaving the dispatch pass.
    pub handler_data: bool,
    pub batching: bool,
}

impl LogConfig {
    /// Every category on.
    pub fn all() -> Self {
        LogConfig {
            process: true,
            extra: true,
            sysfs: true,
            input_data: true,
            handler_data: true,
            batching: true,
        }
    }

    /// `MOTIONHAL_LOG_ALL` turns every category on, otherwise each is read on its own.
    pub fn from_env() -> Self {
        if read_env_bool("MOTIONHAL_LOG_ALL", false) {
            return LogConfig::all();
        }
        LogConfig {
            process: read_env_bool("MOTIONHAL_LOG_PROCESS", false),
            extra: read_env_bool("MOTIONHAL_LOG_EXTRA", false),
            sysfs: read_env_bool("MOTIONHAL_LOG_SYSFS", false),
            input_data: read_env_bool("MOTIONHAL_LOG_INPUT", false),
            handler_data: read_env_bool("MOTIONHAL_LOG_HANDLER", false),
            batching: read_env_bool("MOTIONHAL_LOG_BATCH", false),
        }
    }
}

/// Construction-time settings for [`crate::MotionHal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HalConfig {
    /// IIO device directory holding the motion processor attributes.
    pub iio_path: PathBuf,
    /// Allow the low-power 3-axis quaternion once the DMP is loaded.
    pub lp_quat: bool,
    /// Let each engine keep its own batch rate instead of the fastest one.
    pub multi_rate: bool,
    /// Keep the low-power quaternion running at 200 Hz.
    pub lpq_at_fastest: bool,
    pub smd_threshold: i64,
    pub log: LogConfig,
}

impl Default for HalConfig {
    fn default() -> Self {
        HalConfig {
            iio_path: PathBuf::from(DEFAULT_IIO_PATH),
            lp_quat: true,
            multi_rate: true,
            lpq_at_fastest: true,
            smd_threshold: DEFAULT_SMD_THRESHOLD,
            log: LogConfig::default(),
        }
    }
}

impl HalConfig {
    /// Defaults overridden by `MOTIONHAL_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = HalConfig::default();
        HalConfig {
            iio_path: read_env_path("MOTIONHAL_IIO_PATH").unwrap_or(defaults.iio_path),
            lp_quat: read_env_bool("MOTIONHAL_LP_QUAT", defaults.lp_quat),
            multi_rate: read_env_bool("MOTIONHAL_MULTI_RATE", defaults.multi_rate),
            lpq_at_fastest: read_env_bool("MOTIONHAL_LPQ_AT_FASTEST", defaults.lpq_at_fastest),
            smd_threshold: read_env_u32("MOTIONHAL_SMD_THRESHOLD", defaults.smd_threshold as u32) as i64,
            log: LogConfig::from_env(),
        }
    }
}

pub(crate) fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn read_env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

pub(crate) fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_env_path(name: &str) -> Option<PathBuf> {
    let v = read_env_string(name, "");
    (!v.is_empty()).then(|| PathBuf::from(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_is_tolerant() {
        for v in ["1", "TRUE", " yes ", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{}", v);
        }
        for v in ["0", "false", "No", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{}", v);
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_defaults() {
        let cfg = HalConfig::default();
        assert_eq!(cfg.iio_path, PathBuf::from("/sys/bus/iio/devices/iio:device0"));
        assert!(cfg.lp_quat && cfg.multi_rate && cfg.lpq_at_fastest);
        assert_eq!(cfg.smd_threshold, 3000);
        assert_eq!(cfg.log, LogConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("MOTIONHAL_TEST_SMD", " 4500 ");
        std::env::set_var("MOTIONHAL_TEST_BLANK", "   ");
        std::env::set_var("MOTIONHAL_TEST_FLAG", "off");
        assert_eq!(read_env_u32("MOTIONHAL_TEST_SMD", 3000), 4500);
        assert_eq!(read_env_string("MOTIONHAL_TEST_BLANK", "dflt"), "dflt");
        assert!(!read_env_bool("MOTIONHAL_TEST_FLAG", true));
        assert!(read_env_bool("MOTIONHAL_TEST_UNSET_FLAG", true));
    }

    #[test]
    fn test_log_all_switch() {
        std::env::set_var("MOTIONHAL_LOG_ALL", "1");
        let log = LogConfig::from_env();
        std::env::remove_var("MOTIONHAL_LOG_ALL");
        assert_eq!(log, LogConfig::all());
        assert!(log.sysfs && log.batching);
    }
}
