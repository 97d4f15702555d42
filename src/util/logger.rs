//! Thin wrappers over the `log` crate's macros.
//!
//! `debug!`/`trace!` are compiled out of release builds unless the
//! `hot_log` feature is enabled, so the hottest paths (bitmap set/test,
//! card-table mark, allocation) carry no logging overhead in production.
//! This module is named `logger` (rather than `log`) to avoid IDEs
//! resolving bare `log::` imports to it by mistake.

pub(crate) const HOT_LOG_ENABLED: bool = cfg!(any(not(debug_assertions), feature = "hot_log"));

macro_rules! debug {
    ($($arg:tt)+) => {
        if $crate::util::logger::HOT_LOG_ENABLED {
            log::debug!($($arg)+)
        }
    }
}

macro_rules! trace {
    ($($arg:tt)+) => {
        if $crate::util::logger::HOT_LOG_ENABLED {
            log::trace!($($arg)+)
        }
    }
}

pub(crate) use debug;
pub(crate) use trace;

/// Installs `env_logger` as the global logger. Embedders that already run
/// their own `log::Log` implementation should not call this and should
/// disable the `builtin_env_logger` default feature.
#[cfg(feature = "builtin_env_logger")]
pub fn init_builtin_env_logger() {
    let _ = env_logger::try_init();
}
