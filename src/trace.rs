//! Leveled kernel tracing, in the spirit of the hardware library's
//! `TracePrintf`. Messages at or below the configured level are formatted
//! and handed to a pluggable sink; everything else is dropped before
//! formatting.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

pub struct TraceState {
    pub level: u8,
    pub sink: Option<fn(&str)>,
}

lazy_static! {
    pub static ref TRACE: Mutex<TraceState> = Mutex::new(TraceState {
        level: 0,
        sink: None,
    });
}

pub fn set_trace_level(level: u8) {
    TRACE.lock().level = level;
}

pub fn set_trace_sink(sink: Option<fn(&str)>) {
    TRACE.lock().sink = sink;
}

#[doc(hidden)]
pub fn emit(level: u8, args: fmt::Arguments) {
    let state = TRACE.lock();
    if level <= state.level {
        if let Some(sink) = state.sink {
            sink(&alloc::fmt::format(args));
        }
    }
}

/// `trace_printf!(level, "fmt", args...)`. Level 1 is operational events,
/// level 5 is page-table spelunking.
#[macro_export]
macro_rules! trace_printf {
    ($level:expr, $($arg:tt)*) => {
        $crate::trace::emit($level, format_args!($($arg)*))
    };
}
