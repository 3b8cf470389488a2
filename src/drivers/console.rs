//! Kernel console sink.
//!
//! The paging subsystem's console log lines (`PAGEFAULT`, `EVICT`, `SWAPOUT`, `KILL`, ...)
//! are part of the external interface a test suite reads back (see the crate's top-level
//! documentation). This module replaces the teacher's UART-specific `earlycon` driver
//! (out of scope here — console I/O is an external collaborator) with a pluggable sink
//! the surrounding kernel would install, plus a capturing sink tests assert log lines
//! against.

use core::fmt;

use spin::Mutex;

/// A trait for kernel console sinks.
///
/// The out-of-scope boot sequence is expected to call [`register`] once with a concrete
/// sink (a UART driver, a ring buffer, ...). Until it does, [`get`] returns a no-op sink.
pub trait Console: Send + Sync {
    /// Writes a single byte to the console.
    fn put(&self, byte: u8);
}

static CONSOLE: spin::Once<&'static dyn Console> = spin::Once::new();

/// A handle to the registered console that implements [`fmt::Write`].
pub struct ConsoleRef;

impl fmt::Write for ConsoleRef {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(con) = CONSOLE.get() {
            for byte in s.bytes() {
                con.put(byte);
            }
        }
        Ok(())
    }
}

/// Registers the global console sink.
pub fn register(console: &'static dyn Console) {
    CONSOLE.call_once(|| console);
}

/// Returns a handle to the registered console.
///
/// No guarantee is made that a console has been registered; in that case, writes are
/// silently dropped.
pub fn get() -> ConsoleRef {
    ConsoleRef
}

/// A console sink that records everything written to it, for use in tests that assert
/// against the kernel log-line contract.
#[cfg(test)]
pub struct CapturingConsole {
    buf: Mutex<alloc::string::String>,
}

#[cfg(test)]
impl CapturingConsole {
    /// Creates a new, empty capturing console.
    pub const fn new() -> Self {
        Self {
            buf: Mutex::new(alloc::string::String::new()),
        }
    }

    /// Returns everything written to this console so far and clears the buffer.
    pub fn take(&self) -> alloc::string::String {
        core::mem::take(&mut self.buf.lock())
    }
}

#[cfg(test)]
impl Console for CapturingConsole {
    fn put(&self, byte: u8) {
        self.buf.lock().push(byte as char);
    }
}

/// Registers a process-wide [`CapturingConsole`] the first time it's called, and returns a
/// reference to it.
///
/// Every unit test in this crate's test binary shares one process, so the sink (and the
/// underlying `spin::Once` in [`CONSOLE`]) can only ever be registered once; this helper
/// makes that registration idempotent instead of requiring a single designated test to do
/// it. Callers should [`CapturingConsole::take`] immediately before the action under test
/// to discard any log lines left over from other tests racing on the same sink, and assert
/// with a substring check afterwards since interleaved output from concurrently-running
/// tests may still land in between.
#[cfg(test)]
pub(crate) fn capturing() -> &'static CapturingConsole {
    lazy_static::lazy_static! {
        static ref SINK: CapturingConsole = CapturingConsole::new();
    }
    register(&*SINK);
    &SINK
}
