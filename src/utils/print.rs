//! Helper macros for logging (console printing).
//!
//! Every server-side log line is prefixed with the replica's `gid-id` tag
//! so interleaved output from multiple groups stays attributable.

/// Log TRACE message with bracketed prefix.
///
/// Example:
/// ```ignore
/// pf_trace!(tag; "applied entry at index {}", idx);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("[{}] ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("[{}] ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with bracketed prefix.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("[{}] ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("[{}] ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with bracketed prefix.
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("[{}] ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("[{}] ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with bracketed prefix.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("[{}] ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("[{}] ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with bracketed prefix.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("[{}] ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("[{}] ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error message at ERROR level, then return a `ShardsetError`
/// wrapping the same message.
///
/// Example:
/// ```ignore
/// return logged_err!(tag; "decode of {} bytes failed", blob.len());
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {
        {
            pf_error!($prefix; $fmt_str);
            Err($crate::utils::ShardsetError(
                format!(concat!("[{}] ", $fmt_str), $prefix),
            ))
        }
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        {
            pf_error!($prefix; $fmt_str, $($fmt_arg)*);
            Err($crate::utils::ShardsetError(
                format!(concat!("[{}] ", $fmt_str), $prefix, $($fmt_arg)*),
            ))
        }
    };
}
