// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_context::CrashContext;
use super::emitters::{emit_crashreport, EmitterError};
use super::signal_handler_manager::{chain_signal_handler, previous_handler, PreviousHandler};
use super::signal_safe_writer::SignalSafeWriter;
use crate::shared::configuration::CrashCatcherConfiguration;
use libc::{c_void, siginfo_t, ucontext_t};
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - close
// - getpid
// - open
// - raise
// - read
// - sigaction
// - write
// plus the `gettid` and (Linux) `process_vm_readv` syscalls.

// Using mutexes inside a signal handler is not allowed, so use `AtomicPtr`
// instead to get atomicity.
// This should always be either: null_mut, or `Box::into_raw()`
static CONFIG: AtomicPtr<(CrashCatcherConfiguration, RawFd)> = AtomicPtr::new(ptr::null_mut());

#[derive(Debug, thiserror::Error)]
pub enum CrashHandlerError {
    #[error("No crash catcher config available")]
    NoConfig,
    #[error("Failed to emit the crash report: {0}")]
    EmitterError(#[from] EmitterError),
}

/// Updates the configuration used by the crash handler, together with the already open file
/// descriptor the report is written to.
///
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub(crate) fn update_config(config: CrashCatcherConfiguration, fd: RawFd) {
    let box_ptr = Box::into_raw(Box::new((config, fd)));
    let old = CONFIG.swap(box_ptr, SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe {
            std::mem::drop(Box::from_raw(old));
        }
    }
}

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    // The interrupted code may be looking at errno.
    let saved_errno = errno::errno();
    // Handle the signal.  Note this has a guard to ensure that we only generate
    // one crash report per process.
    let _ = handle_posix_signal_impl(signum, sig_info, ucontext as *const ucontext_t);
    errno::set_errno(saved_errno);
    // SAFETY: No preconditions.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Disables crash catching.
/// Note that this does not restore the old signal handlers, but rather turns the capture into a
/// no-op, and then chains the old handlers.  This means that handlers registered after the
/// crash catcher will continue to work as expected.
///
/// # Preconditions
///   None
/// # Safety
///   None
/// # Atomicity
///   This function is atomic and idempotent.  Calling it multiple times is allowed.
pub fn disable() {
    ENABLED.store(false, SeqCst);
}

/// Enables crash catching, if it had been previously disabled.
/// If crash catching has not been installed, this function will have no effect.
///
/// # Preconditions
///   None
/// # Safety
///   None
/// # Atomicity
///   This function is atomic and idempotent.  Calling it multiple times is allowed.
pub fn enable() {
    ENABLED.store(true, SeqCst);
}

/// A signal sent by another process to a signal the process ignored is not a crash: the process
/// keeps running once we chain.
unsafe fn is_ignored_user_signal(signum: i32, sig_info: *const siginfo_t) -> bool {
    !sig_info.is_null()
        && crate::is_user_sent((*sig_info).si_code)
        && matches!(previous_handler(signum), Some(PreviousHandler::Ignore))
}

fn handle_posix_signal_impl(
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
) -> Result<(), CrashHandlerError> {
    if !ENABLED.load(SeqCst) {
        return Ok(());
    }
    // SAFETY: `sig_info` comes from the kernel.
    if unsafe { is_ignored_user_signal(signum, sig_info) } {
        return Ok(());
    }

    // If this code hits a stack overflow, or reads through a corrupted frame pointer, then it
    // will result in a segfault.  That situation is protected by the one-time guard.

    // One-time guard to guarantee at most one crash report per process
    static NUM_TIMES_CALLED: AtomicU64 = AtomicU64::new(0);
    if NUM_TIMES_CALLED.fetch_add(1, SeqCst) > 0 {
        // In the case where some lower-level signal handler recovered the error
        // we don't want to spam the system with calls.  Make this one shot.
        return Ok(());
    }

    // Leak config to avoid calling `drop` during a crash
    let config_ptr = CONFIG.swap(ptr::null_mut(), SeqCst);
    if config_ptr.is_null() {
        return Err(CrashHandlerError::NoConfig);
    }
    // SAFETY: non-null pointers in CONFIG come from `Box::into_raw`.
    let (config, fd) = unsafe { &*config_ptr };

    // SAFETY: the pointers are the ones handed to the signal handler.
    let mut ctx = unsafe { CrashContext::capture(signum, sig_info, ucontext) };
    let mut writer = SignalSafeWriter::new(*fd);
    emit_crashreport(&mut writer, &mut ctx, config)?;
    Ok(())
}
