// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Native crash catching based on UNIX signals.
//!
//! The crate installs a handler for the fatal signals (SIGSEGV, SIGBUS, SIGILL,
//! SIGABRT, SIGFPE by default) so that a process dying in native code leaves a
//! crash report behind instead of disappearing silently.
//!
//! Architecturally, it consists of three parts:
//! 1. The signal handler registry. `install()` swaps the crash handler in for
//!    every signal of the configured set, records the handler it displaced, and
//!    sets up an alternate signal stack so stack overflows can still be reported.
//!    Installation is once per process; later calls are no-ops.
//! 2. The crash capture routine. It runs under the constraints of a signal
//!    handler: <https://man7.org/linux/man-pages/man7/signal-safety.7.html>.
//!    Memory allocation, locks and buffered I/O are off limits, so the context
//!    (signal, faulting address, thread, registers, a frame-pointer stack walk)
//!    is gathered on the signal stack and written with `write(2)` to a file
//!    descriptor opened at install time.  The routine then restores the
//!    displaced handler and re-raises (or calls it), so the process terminates
//!    exactly as it would have without this crate: same signal, same core dump,
//!    same wait status for supervisors.
//! 3. The report parser. The emitted report is line oriented text with JSON
//!    payloads between marker lines.  `receiver::parse_report` turns it back
//!    into a [`CrashReport`].  This is the downstream side and never runs in a
//!    signal handler.
//!
//! Re-entrancy: a one-shot guard makes sure only the first fault is captured.
//! A fault inside the capture routine itself (e.g. a corrupted stack) skips
//! capture and goes straight to the displaced handler.
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

#[cfg(all(unix, feature = "collector"))]
mod collector;
mod crash_info;
#[cfg(feature = "receiver")]
pub mod receiver;
mod shared;

#[cfg(all(unix, feature = "collector"))]
pub use collector::*;
pub use crash_info::*;
#[cfg(unix)]
pub use shared::configuration::{
    CrashCatcherConfiguration, ReportSink, StacktraceCollection, ENV_ALT_STACK, ENV_MEMORY_MAPS,
    ENV_OUTPUT, ENV_SIGNALS, ENV_STACKTRACE,
};
pub use shared::constants::*;

#[cfg(unix)]
pub use unix::*;

#[cfg(unix)]
mod unix {
    use nix::sys::signal::Signal;

    /// The signals caught when the configuration does not say otherwise.
    /// These are the signals whose default disposition terminates the process and
    /// which are raised by faults rather than by normal control flow.
    pub const DEFAULT_SIGNALS: [libc::c_int; 5] = [
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGILL,
        libc::SIGABRT,
        libc::SIGFPE,
    ];

    pub fn default_signals() -> Vec<libc::c_int> {
        DEFAULT_SIGNALS.to_vec()
    }

    pub fn signal_from_signum(signum: libc::c_int) -> anyhow::Result<Signal> {
        Ok(Signal::try_from(signum)?)
    }

}
