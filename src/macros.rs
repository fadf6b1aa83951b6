//! Logging shims. They forward to the `log` crate when the `log` feature is
//! enabled and compile down to nothing otherwise, so the heap can be installed
//! as the global allocator without a logger calling back into it.

#[cfg(feature = "log")]
macro_rules! log_trace {
    ($($arg:tt)*) => { log::trace!($($arg)*) };
}

#[cfg(feature = "log")]
macro_rules! log_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

#[cfg(feature = "log")]
macro_rules! log_warn {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! log_trace {
    ($($arg:expr),* $(,)?) => {{ $( let _ = &$arg; )* }};
}

#[cfg(not(feature = "log"))]
macro_rules! log_debug {
    ($($arg:expr),* $(,)?) => {{ $( let _ = &$arg; )* }};
}

#[cfg(not(feature = "log"))]
macro_rules! log_warn {
    ($($arg:expr),* $(,)?) => {{ $( let _ = &$arg; )* }};
}
