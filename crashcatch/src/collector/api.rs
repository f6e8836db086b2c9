// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_handler::update_config;
use super::signal_handler_manager::{is_init_started, register_crash_handlers, RegistrationError};
use crate::shared::configuration::{CrashCatcherConfiguration, ReportSink};
use anyhow::Context;
use std::fs::OpenOptions;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use tracing::{debug, info, warn};

/// Installs the crash handlers, configured from the `CRASHCATCH_*` environment variables.
///
/// Nothing is reported back to the caller: problems are logged, and a process that could not be
/// fully covered keeps running with whatever could be installed.  Calling this more than once is
/// a no-op.
///
/// PRECONDITIONS:
///     None.
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     See [`init`].
pub fn install() {
    let config = CrashCatcherConfiguration::from_env().unwrap_or_else(|e| {
        warn!(error = ?e, "Invalid crash catcher configuration in the environment, using defaults");
        CrashCatcherConfiguration::default()
    });
    if let Err(e) = init(config) {
        warn!(error = ?e, "Crash catching is not active");
    }
}

/// Installs the crash handlers with an explicit configuration.
///
/// The report sink is opened here, so the crash handler only ever writes to an open file
/// descriptor.  A second call returns `Ok(())` without changing anything: the configuration of
/// the first call stays in effect for the life of the process.
///
/// PRECONDITIONS:
///     None.
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     A fault on another thread while this runs is either caught, or handled by whatever
///     handled it before.
pub fn init(config: CrashCatcherConfiguration) -> anyhow::Result<()> {
    if is_init_started() {
        debug!("Crash handlers already installed, ignoring");
        return Ok(());
    }
    let fd = open_sink(config.sink()).context("Unable to open the crash report sink")?;
    update_config(config.clone(), fd);

    let summary = match register_crash_handlers(&config) {
        Ok(summary) => summary,
        Err(RegistrationError::AlreadyInstalled) => {
            debug!("Crash handlers already installed, ignoring");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    anyhow::ensure!(
        !summary.installed.is_empty() || config.signals().is_empty(),
        "No crash handler could be registered: {:?}",
        summary.failed
    );
    info!(
        signals = ?summary.installed,
        failed = summary.failed.len(),
        alt_stack = summary.alt_stack,
        "Crash handlers installed"
    );
    Ok(())
}

fn open_sink(sink: &ReportSink) -> anyhow::Result<RawFd> {
    match sink {
        ReportSink::Stderr => Ok(libc::STDERR_FILENO),
        ReportSink::Fd(fd) => {
            // SAFETY: F_GETFD has no side effects.
            anyhow::ensure!(
                unsafe { libc::fcntl(*fd, libc::F_GETFD) } != -1,
                "File descriptor {fd} is not open"
            );
            Ok(*fd)
        }
        ReportSink::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .custom_flags(libc::O_CLOEXEC)
                .open(path)
                .with_context(|| format!("Unable to open {}", path.display()))?;
            // Stays open for the life of the process.
            Ok(file.into_raw_fd())
        }
    }
}

/// Deliberately crashes the process with SIGSEGV, by loading from address 0.
///
/// Used to check the whole pipeline: with the crash handlers installed, this leaves a report
/// behind and the process terminates by SIGSEGV exactly as it would without them.
#[inline(never)]
pub fn trigger_fault() -> ! {
    // SAFETY: this is meant to crash.
    unsafe { fault_at_null_address() };
    // Only reached if a chained handler recovered from the fault.
    std::process::abort()
}

#[inline(never)]
unsafe fn fault_at_null_address() {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    std::arch::asm!("mov eax, [0]", out("eax") _, options(nostack));

    #[cfg(target_arch = "aarch64")]
    std::arch::asm!("mov x0, #0", "ldr x1, [x0]", out("x0") _, out("x1") _, options(nostack));

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    libc::raise(libc::SIGSEGV);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_open_sink_stderr() {
        assert_eq!(open_sink(&ReportSink::Stderr).unwrap(), libc::STDERR_FILENO);
    }

    #[test]
    fn test_open_sink_fd() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        assert_eq!(open_sink(&ReportSink::Fd(fd)).unwrap(), fd);
        // Above any open file limit.
        assert!(open_sink(&ReportSink::Fd(1 << 30)).is_err());
    }

    #[test]
    fn test_open_sink_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.log");
        std::fs::write(&path, "existing\n").unwrap();

        let fd = open_sink(&ReportSink::File(path.clone())).unwrap();
        let written = unsafe { libc::write(fd, b"report\n".as_ptr() as *const libc::c_void, 7) };
        assert_eq!(written, 7);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
        unsafe { libc::close(fd) };

        let mut content = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "existing\nreport\n");
    }

    #[test]
    fn test_open_sink_file_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("crash.log");
        let err = open_sink(&ReportSink::File(path)).unwrap_err();
        assert!(err.to_string().contains("Unable to open"));
    }
}
