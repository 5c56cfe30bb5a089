//! Crash-signal diagnostics.
//!
//! SIGSEGV and SIGBUS get a handler that writes a one-line diagnostic
//! (node name, signal number, pid) to stderr before the default action
//! re-runs and the process dies. The handler is async-signal-safe: no
//! allocation, no locks, only `write(2)` on pre-formatted bytes.
//!
//! Installed once per process by node initialization; subsequent nodes
//! in the same process keep the first registration.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

/// Node name published for the handler to read.
static NODE_NAME: AtomicU32 = AtomicU32::new(0);

static INSTALL: Once = Once::new();

/// Installs the SIGSEGV/SIGBUS diagnostic handler (Unix only; no-op
/// elsewhere).
pub(crate) fn install_crash_handler(node: u32) {
    NODE_NAME.store(node, Ordering::Relaxed);
    INSTALL.call_once(|| {
        #[cfg(unix)]
        // SAFETY: sigaction with a valid handler function; SA_RESETHAND
        // restores the default action so the fault re-raises after the
        // diagnostic line.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            let handler: extern "C" fn(libc::c_int) = handle_fatal_signal;
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_RESETHAND | libc::SA_NODEFER;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
            libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
        }
    });
}

/// The handler body. Returning re-executes the faulting instruction
/// under the default disposition, which kills the process.
#[cfg(unix)]
extern "C" fn handle_fatal_signal(signal: libc::c_int) {
    let mut line = [0u8; 96];
    let mut at = 0;
    at += put(&mut line[at..], b"argon: node ");
    at += put_u64(&mut line[at..], u64::from(NODE_NAME.load(Ordering::Relaxed)));
    at += put(&mut line[at..], b" caught fatal signal ");
    at += put_u64(&mut line[at..], signal.unsigned_abs() as u64);
    at += put(&mut line[at..], b" (pid ");
    at += put_u64(&mut line[at..], u64::from(std::process::id()));
    at += put(&mut line[at..], b")\n");
    // SAFETY: write(2) is async-signal-safe; the buffer is a stack
    // array of `at` initialized bytes.
    unsafe {
        libc::write(2, line.as_ptr().cast(), at);
    }
}

/// Copies `text` into `out`, returning the bytes written.
fn put(out: &mut [u8], text: &[u8]) -> usize {
    let n = text.len().min(out.len());
    out[..n].copy_from_slice(&text[..n]);
    n
}

/// Formats `value` in decimal into `out`, returning the bytes written.
/// Allocation-free so the signal handler can use it.
fn put_u64(out: &mut [u8], mut value: u64) -> usize {
    let mut digits = [0u8; 20];
    let mut count = 0;
    loop {
        digits[count] = b'0' + (value % 10) as u8;
        value /= 10;
        count += 1;
        if value == 0 {
            break;
        }
    }
    let n = count.min(out.len());
    for i in 0..n {
        out[i] = digits[count - 1 - i];
    }
    n
}
