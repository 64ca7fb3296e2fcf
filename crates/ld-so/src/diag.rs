//! Early diagnostics on fd 2.
//!
//! Everything here must stay usable from the panic handler, so the basic
//! writers avoid the allocator: strings go out as-is, numbers are rendered
//! into stack buffers.

use alloc::string::ToString;
use core::fmt;
use syscalls::Sysno;

const STDERR: usize = 2;

/// Writing diagnostics must never itself abort; the result is dropped.
pub fn print_str(s: &str) {
    unsafe {
        syscalls::raw_syscall!(Sysno::write, STDERR, s.as_ptr(), s.len());
    }
}

pub fn print_dec(value: usize) {
    let mut buf = itoa::Buffer::new();
    print_str(buf.format(value));
}

pub fn print_hex(value: usize) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut buf = [0u8; 2 + usize::BITS as usize / 4];
    buf[0] = b'0';
    buf[1] = b'x';
    let mut len = 2;
    let mut shift = usize::BITS as usize;
    let mut seen = false;
    while shift != 0 {
        shift -= 4;
        let nibble = (value >> shift) & 0xf;
        if nibble != 0 || seen || shift == 0 {
            seen = true;
            buf[len] = DIGITS[nibble];
            len += 1;
        }
    }
    print_str(unsafe { core::str::from_utf8_unchecked(&buf[..len]) });
}

pub fn print(args: fmt::Arguments) {
    print_str(&args.to_string());
}

#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {{
        $crate::diag::print(format_args!($fmt $(, $($arg)+)?));
        $crate::diag::print_str("\n");
    }}
}

/// Forwards the core's `log` records to fd 2. Installed only when the
/// debug environment variable is present.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        println!("ld-so: {}: {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

pub fn init_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}
