//! Diagnostic console.
//!
//! The console is a process-wide slot holding at most one [`ByteSink`]. Until
//! a sink is installed (normally the UART once it has been brought up),
//! everything printed is discarded.

use core::{
    fmt::{self, Write as _},
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::Mutex;

type Slot = Mutex<Option<&'static dyn ByteSink>>;

static CONSOLE: Slot = Mutex::new(None);
static PANICKED: AtomicBool = AtomicBool::new(false);

/// A byte-oriented output device.
pub trait ByteSink: Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

/// Adapts a [`ByteSink`] to [`fmt::Write`].
pub struct SinkWriter<'a>(pub &'a dyn ByteSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Routes console output to `sink`, replacing the previous one.
pub fn install(sink: &'static dyn ByteSink) -> Option<&'static dyn ByteSink> {
    CONSOLE.lock().replace(sink)
}

/// Detaches the current sink. Output is discarded afterwards.
pub fn uninstall() -> Option<&'static dyn ByteSink> {
    CONSOLE.lock().take()
}

#[must_use]
pub fn is_enabled() -> bool {
    CONSOLE.lock().is_some()
}

/// Returns the installed sink without waiting for the console lock.
///
/// If the lock is held, its holder was interrupted by the panic and never
/// resumes, so the lock is released by force.
///
/// # Safety
///
/// Only the panicking processor may be running, and the caller must not
/// return to the code it interrupted.
#[must_use]
pub unsafe fn panic_sink() -> Option<&'static dyn ByteSink> {
    unsafe { seize(&CONSOLE) }
}

unsafe fn seize(slot: &Slot) -> Option<&'static dyn ByteSink> {
    if let Some(sink) = slot.try_lock() {
        return *sink;
    }
    unsafe { slot.force_unlock(); }
    slot.try_lock().and_then(|sink| *sink)
}

/// Marks the system as panicked. Further [`print`] calls never return.
pub fn mark_panicked() {
    PANICKED.store(true, Ordering::Release);
}

pub fn print(args: fmt::Arguments) {
    if PANICKED.load(Ordering::Acquire) {
        loop {
            // Only the panic path may write from now on.
            hint::spin_loop();
        }
    }
    let sink = *CONSOLE.lock();
    if let Some(sink) = sink {
        let _ = SinkWriter(sink).write_fmt(args);
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}
