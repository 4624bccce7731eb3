// src/macros.rs

//
// Crate-internal logging facade.
//
// With `logging`, every event goes to tracing under the "warren" target so
// applications can filter the whole crate with one directive
// (RUST_LOG=warren=debug). Without it, errors are written to stderr with a
// "warren:" prefix and everything else compiles away.
//

#![allow(unused_macros)]

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "warren", $($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "warren", $($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "warren", $($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "warren", $($arg)*)
    };
}

// --------------------
// logging disabled
// --------------------

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!("warren: {}", format_args!($($arg)*))
    };
}

// Arguments are still type-checked so both feature sets see the same code.
#[cfg(not(feature = "logging"))]
macro_rules! log_silent {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::macros::log_silent!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::macros::log_silent!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::macros::log_silent!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
pub(crate) use log_silent;

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
