//! Console output boundary.
//!
//! A single registered `putc` sink carries everything: the `print!`
//! macros, the log backend, and the write/putchar syscalls. Until a
//! driver registers one, output is dropped — the core stays functional
//! with no console at all.

use core::fmt;

use spin::Mutex;

/// The collaborator's character sink.
pub type PutcFn = fn(u8);

static SINK: Mutex<Option<PutcFn>> = Mutex::new(None);

/// Install the console driver's `putc`.
pub fn register_sink(putc: PutcFn) {
    *SINK.lock() = Some(putc);
}

pub fn putc(byte: u8) {
    if let Some(sink) = *SINK.lock() {
        sink(byte);
    }
}

pub fn write_bytes(bytes: &[u8]) -> usize {
    if let Some(sink) = *SINK.lock() {
        for &b in bytes {
            sink(b);
        }
    }
    bytes.len()
}

/// `core::fmt` adapter over the sink.
pub struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = Writer.write_fmt(args);
}
