// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delimiters of the crash report stream.
//!
//! A report is a sequence of sections.  Each section starts with a `BEGIN` marker line and ends
//! with the matching `END` marker line; the lines in between carry the section's payload, which
//! is JSON for every section except thread names and files.  The whole report is bracketed by
//! [`CRASHCATCH_BEGIN_REPORT`] and [`CRASHCATCH_DONE`], so a consumer can tell a complete report
//! from one that was cut short by a second fault.

/// First line of every report.
pub const CRASHCATCH_BEGIN_REPORT: &str = "CRASHCATCH_BEGIN_REPORT";

/// Signal information: JSON with `si_signo`, `si_code`, their human readable names, `si_errno`,
/// and the faulting address for the signals that carry one.
pub const CRASHCATCH_BEGIN_SIGINFO: &str = "CRASHCATCH_BEGIN_SIGINFO";
pub const CRASHCATCH_END_SIGINFO: &str = "CRASHCATCH_END_SIGINFO";

/// Process information: JSON with the pid and the tid of the crashing thread.
pub const CRASHCATCH_BEGIN_PROCINFO: &str = "CRASHCATCH_BEGIN_PROCINFO";
pub const CRASHCATCH_END_PROCINFO: &str = "CRASHCATCH_END_PROCINFO";

/// Name of the crashing thread, as raw text (Linux only).
pub const CRASHCATCH_BEGIN_THREAD_NAME: &str = "CRASHCATCH_BEGIN_THREAD_NAME";
pub const CRASHCATCH_END_THREAD_NAME: &str = "CRASHCATCH_END_THREAD_NAME";

/// Registers of the faulting frame: JSON with `ip`, `sp` and `fp`.
pub const CRASHCATCH_BEGIN_UCONTEXT: &str = "CRASHCATCH_BEGIN_UCONTEXT";
pub const CRASHCATCH_END_UCONTEXT: &str = "CRASHCATCH_END_UCONTEXT";

/// Stack frames, one JSON object per line, innermost first.
pub const CRASHCATCH_BEGIN_STACKTRACE: &str = "CRASHCATCH_BEGIN_STACKTRACE";
pub const CRASHCATCH_END_STACKTRACE: &str = "CRASHCATCH_END_STACKTRACE";
/// Inside the stacktrace section: the walk stopped at [`MAX_BACKTRACE_FRAMES`].
pub const CRASHCATCH_STACKTRACE_TRUNCATED: &str = "CRASHCATCH_STACKTRACE_TRUNCATED";

/// A text file copied verbatim (e.g. `/proc/self/maps`).  The begin marker is followed by a space
/// and the path of the file.
pub const CRASHCATCH_BEGIN_FILE: &str = "CRASHCATCH_BEGIN_FILE";
pub const CRASHCATCH_END_FILE: &str = "CRASHCATCH_END_FILE";

/// Last line of a complete report.
pub const CRASHCATCH_DONE: &str = "CRASHCATCH_DONE";

/// Maximum number of frames collected by the stack walk.
///
/// This limit prevents runaway frame walking in case of stack corruption.
pub const MAX_BACKTRACE_FRAMES: usize = 128;

/// The alternate signal stack is at least this many pages.  The default `SIGSTKSZ` (8KiB on most
/// platforms) is too tight for a handler that keeps the crash context on the stack.
pub const ALT_STACK_MIN_PAGES: usize = 16;

/// Size of the stack buffer the crash report is formatted into before each `write(2)`.
pub const REPORT_BUFFER_LEN: usize = 1024;
