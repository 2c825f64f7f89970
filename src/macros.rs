// src/macros.rs

//
// Logging macros
//
// logging feature enabled  → tracing
// logging feature disabled → log_error prints to stderr, the rest only
//                            type-check their arguments
//
// All four expand to statements; call them with a trailing `;`.
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

macro_rules! log_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::error!($($arg)*);
        #[cfg(not(feature = "logging"))]
        eprintln!($($arg)*);
    };
}

// --------------------
// WARN
// --------------------

macro_rules! log_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::warn!($($arg)*);
        #[cfg(not(feature = "logging"))]
        let _ = format_args!($($arg)*);
    };
}

// --------------------
// INFO
// --------------------

macro_rules! log_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::info!($($arg)*);
        #[cfg(not(feature = "logging"))]
        let _ = format_args!($($arg)*);
    };
}

// --------------------
// DEBUG
// --------------------

macro_rules! log_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        tracing::debug!($($arg)*);
        #[cfg(not(feature = "logging"))]
        let _ = format_args!($($arg)*);
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
