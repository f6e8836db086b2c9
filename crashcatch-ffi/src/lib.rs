// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! C entry points for applications that embed crashcatch from native code.
//!
//! Errors are logged through `tracing` and reported as a [`CrashcatchStatus`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use crashcatch::{CrashCatcherConfiguration, ReportSink};
use libc::{c_char, c_int};
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashcatchStatus {
    Ok = 0,
    Error = 1,
}

impl From<anyhow::Result<()>> for CrashcatchStatus {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => CrashcatchStatus::Ok,
            Err(e) => {
                tracing::warn!(error = ?e, "Crash catching is not active");
                CrashcatchStatus::Error
            }
        }
    }
}

fn init_with_sink(sink: ReportSink) -> anyhow::Result<()> {
    let mut config = CrashCatcherConfiguration::from_env()?;
    config.set_sink(sink);
    crashcatch::init(config)
}

#[no_mangle]
/// Installs the crash handlers, configured from the `CRASHCATCH_*` environment variables.
/// Reports are written to stderr unless `CRASHCATCH_OUTPUT` names a file.
///
/// # Preconditions
///   None
/// # Safety
///   Crash-tracking functions are not reentrant.
///   No other crash-handler functions should be called concurrently.
/// # Atomicity
///   Calling it more than once is allowed, later calls do nothing.
pub extern "C" fn crashcatch_install() {
    crashcatch::install();
}

#[no_mangle]
#[must_use]
/// Installs the crash handlers, writing reports to `fd`.
/// The descriptor must stay open for the life of the process.
///
/// # Preconditions
///   `fd` is an open file descriptor.
/// # Safety
///   Crash-tracking functions are not reentrant.
///   No other crash-handler functions should be called concurrently.
/// # Atomicity
///   Calling it more than once is allowed, later calls do nothing and report success.
pub extern "C" fn crashcatch_init_with_fd(fd: c_int) -> CrashcatchStatus {
    init_with_sink(ReportSink::Fd(fd)).into()
}

#[no_mangle]
#[must_use]
/// Installs the crash handlers, appending reports to the file at `path` (created if missing).
///
/// # Preconditions
///   `path` is a valid, nul terminated C string.
/// # Safety
///   `path` must be null or point to a nul terminated string.
///   Crash-tracking functions are not reentrant.
///   No other crash-handler functions should be called concurrently.
/// # Atomicity
///   Calling it more than once is allowed, later calls do nothing and report success.
pub unsafe extern "C" fn crashcatch_init_with_path(path: *const c_char) -> CrashcatchStatus {
    if path.is_null() {
        tracing::warn!("crashcatch_init_with_path called with a null path");
        return CrashcatchStatus::Error;
    }
    let path = PathBuf::from(OsStr::from_bytes(CStr::from_ptr(path).to_bytes()));
    init_with_sink(ReportSink::File(path)).into()
}

#[no_mangle]
/// Deliberately crashes the process with SIGSEGV.  Never returns.
///
/// # Preconditions
///   None
/// # Safety
///   Terminates the process.
pub extern "C" fn crashcatch_trigger_fault() -> ! {
    crashcatch::trigger_fault()
}

#[no_mangle]
/// Disables crash catching.
/// Note that this does not restore the old signal handlers, but rather turns the capture into a
/// no-op, and then chains the old handlers.
///
/// # Preconditions
///   None
/// # Safety
///   None
/// # Atomicity
///   This function is atomic and idempotent.  Calling it multiple times is allowed.
pub extern "C" fn crashcatch_disable() {
    crashcatch::disable();
}

#[no_mangle]
/// Enables crash catching, if it had been previously disabled.
///
/// # Preconditions
///   None
/// # Safety
///   None
/// # Atomicity
///   This function is atomic and idempotent.  Calling it multiple times is allowed.
pub extern "C" fn crashcatch_enable() {
    crashcatch::enable();
}

#[no_mangle]
/// True once the crash handlers have been installed.
pub extern "C" fn crashcatch_is_installed() -> bool {
    crashcatch::is_installed()
}
