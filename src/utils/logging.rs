//! Conditional logging macros gated on a module-level `ENABLE_LOGS` flag.
//!
//! Modules that use these define the flag once:
//! ```rust
//! const ENABLE_LOGS: bool = true;
//! ```
//! and import the macros from the crate root:
//! ```rust,ignore
//! use crate::{log_error, log_info, log_warn};
//! ```

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
