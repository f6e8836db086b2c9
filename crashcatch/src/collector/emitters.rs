// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_context::CrashContext;
use super::frame_pointer_walker::RawFrame;
use crate::shared::constants::*;
use crate::{translate_si_code, CrashCatcherConfiguration, SignalNames, StacktraceCollection};
use std::ffi::CStr;
use std::io::Write;
use thiserror::Error;

// Everything in this file runs inside the signal handler.  Formatting goes through `write!` into
// a `SignalSafeWriter`, which only formats integers and static strings: no allocation.  Files are
// read with `open`/`read`/`close` into fixed buffers.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("Failed to write to output: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Writes the crash report for `ctx` onto `w`.
///
/// Signal, process and register information goes out first and is flushed before the stack is
/// walked, so a fault during the walk still leaves those behind.
///
/// SAFETY:
///     Crash-tracking functions are not reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function is not atomic. A crash during its execution may lead to
///     a truncated report, without the `CRASHCATCH_DONE` line.
pub(crate) fn emit_crashreport(
    w: &mut impl Write,
    ctx: &mut CrashContext,
    config: &CrashCatcherConfiguration,
) -> Result<(), EmitterError> {
    writeln!(w, "{CRASHCATCH_BEGIN_REPORT}")?;
    emit_siginfo(w, ctx)?;
    emit_procinfo(w, ctx)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    emit_thread_name(w, ctx.tid)?;
    emit_ucontext(w, ctx)?;

    if config.stacktrace() != StacktraceCollection::Disabled {
        ctx.collect_frames(config.stacktrace());
        emit_stacktrace(w, ctx.frames(), ctx.truncated)?;
    }

    if config.include_memory_maps() {
        emit_proc_self_maps(w)?;
    }

    writeln!(w, "{CRASHCATCH_DONE}")?;
    w.flush()?;
    Ok(())
}

fn emit_siginfo(w: &mut impl Write, ctx: &CrashContext) -> Result<(), EmitterError> {
    let si_signo = ctx.signum;
    let si_signo_human_readable: SignalNames = si_signo.into();
    let si_code = ctx.si_code;
    let si_code_human_readable = translate_si_code(si_signo, si_code);

    writeln!(w, "{CRASHCATCH_BEGIN_SIGINFO}")?;
    write!(w, "{{")?;
    write!(w, "\"si_code\": {si_code}")?;
    write!(
        w,
        ", \"si_code_human_readable\": \"{si_code_human_readable:?}\""
    )?;
    write!(
        w,
        ", \"si_code_description\": \"{}\"",
        si_code_human_readable.description()
    )?;
    write!(w, ", \"si_errno\": {}", ctx.si_errno)?;
    write!(w, ", \"si_signo\": {si_signo}")?;
    write!(
        w,
        ", \"si_signo_human_readable\": \"{si_signo_human_readable:?}\""
    )?;
    if let Some(si_addr) = ctx.si_addr {
        write!(w, ", \"si_addr\": \"{si_addr:#018x}\"")?;
    }
    if let Some(si_pid) = ctx.si_pid {
        write!(w, ", \"si_pid\": {si_pid}")?;
    }
    writeln!(w, "}}")?;
    writeln!(w, "{CRASHCATCH_END_SIGINFO}")?;
    w.flush()?;
    Ok(())
}

fn emit_procinfo(w: &mut impl Write, ctx: &CrashContext) -> Result<(), EmitterError> {
    writeln!(w, "{CRASHCATCH_BEGIN_PROCINFO}")?;
    writeln!(w, "{{\"pid\": {}, \"tid\": {}}}", ctx.pid, ctx.tid)?;
    writeln!(w, "{CRASHCATCH_END_PROCINFO}")?;
    w.flush()?;
    Ok(())
}

fn emit_ucontext(w: &mut impl Write, ctx: &CrashContext) -> Result<(), EmitterError> {
    let Some(regs) = ctx.registers else {
        return Ok(());
    };
    writeln!(w, "{CRASHCATCH_BEGIN_UCONTEXT}")?;
    writeln!(
        w,
        "{{\"ip\": \"{:#018x}\", \"sp\": \"{:#018x}\", \"fp\": \"{:#018x}\"}}",
        regs.ip, regs.sp, regs.fp
    )?;
    writeln!(w, "{CRASHCATCH_END_UCONTEXT}")?;
    w.flush()?;
    Ok(())
}

/// One line per frame.  Each frame is flushed on its own so a partial walk still makes it out.
/// A walk that hit the frame limit is flagged before the end marker.
fn emit_stacktrace(
    w: &mut impl Write,
    frames: &[RawFrame],
    truncated: bool,
) -> Result<(), EmitterError> {
    writeln!(w, "{CRASHCATCH_BEGIN_STACKTRACE}")?;
    for frame in frames {
        write!(w, "{{\"ip\": \"{:#018x}\"", frame.ip)?;
        if frame.sp != 0 {
            write!(w, ", \"sp\": \"{:#018x}\"", frame.sp)?;
        }
        if frame.bp != 0 {
            write!(w, ", \"fp\": \"{:#018x}\"", frame.bp)?;
        }
        writeln!(w, "}}")?;
        w.flush()?;
    }
    if truncated {
        writeln!(w, "{CRASHCATCH_STACKTRACE_TRUNCATED}")?;
    }
    writeln!(w, "{CRASHCATCH_END_STACKTRACE}")?;
    w.flush()?;
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn emit_proc_self_maps(w: &mut impl Write) -> Result<(), EmitterError> {
    emit_text_file(w, c"/proc/self/maps")
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn emit_proc_self_maps(_w: &mut impl Write) -> Result<(), EmitterError> {
    Ok(())
}

/// Formats `val` in decimal at the start of `buf`, returns the number of bytes used.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn write_decimal(buf: &mut [u8], mut val: u64) -> Option<usize> {
    let mut i = 0;
    loop {
        if i >= buf.len() {
            return None;
        }
        buf[i] = b'0' + (val % 10) as u8;
        val /= 10;
        i += 1;
        if val == 0 {
            break;
        }
    }
    buf[..i].reverse();
    Some(i)
}

/// Emits the name of thread `tid` from `/proc/self/task/<tid>/comm`.  Missing or unreadable
/// files are skipped without failing the report.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn emit_thread_name(w: &mut impl Write, tid: u64) -> Result<(), EmitterError> {
    const PREFIX: &[u8] = b"/proc/self/task/";
    const SUFFIX: &[u8] = b"/comm\0";

    let mut path_buf = [0u8; 64];
    let mut idx = PREFIX.len();
    path_buf[..idx].copy_from_slice(PREFIX);
    let Some(len) = write_decimal(&mut path_buf[idx..], tid) else {
        return Ok(());
    };
    idx += len;
    if idx + SUFFIX.len() > path_buf.len() {
        return Ok(());
    }
    path_buf[idx..idx + SUFFIX.len()].copy_from_slice(SUFFIX);

    // SAFETY: `path_buf` is nul terminated.
    let fd = unsafe { libc::open(path_buf.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
    if fd < 0 {
        return Ok(());
    }

    writeln!(w, "{CRASHCATCH_BEGIN_THREAD_NAME}")?;
    let result = copy_fd(w, fd);
    // SAFETY: fd was opened above.
    let _ = unsafe { libc::close(fd) };
    if !result?.ends_with_newline {
        writeln!(w)?;
    }
    writeln!(w, "{CRASHCATCH_END_THREAD_NAME}")?;
    w.flush()?;
    Ok(())
}

/// Emit a file onto the given handle, in the format
///
/// CRASHCATCH_BEGIN_FILE <path>
/// <FILE BYTES>
/// CRASHCATCH_END_FILE <path>
///
/// A file that cannot be opened is skipped.
/// PRECONDITIONS:
///     The receiver expects the file to contain valid UTF-8 compatible text.
/// SIGNAL SAFETY:
///     `open`, `read` and `close` into a fixed buffer, nothing else.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn emit_text_file(w: &mut impl Write, path: &CStr) -> Result<(), EmitterError> {
    // SAFETY: `path` is a valid C string.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Ok(());
    }

    write!(w, "{CRASHCATCH_BEGIN_FILE} ")?;
    w.write_all(path.to_bytes())?;
    writeln!(w)?;
    let result = copy_fd(w, fd);
    // SAFETY: fd was opened above.
    let _ = unsafe { libc::close(fd) };
    if !result?.ends_with_newline {
        writeln!(w)?;
    }
    write!(w, "{CRASHCATCH_END_FILE} ")?;
    w.write_all(path.to_bytes())?;
    writeln!(w)?;
    w.flush()?;
    Ok(())
}

struct Copied {
    ends_with_newline: bool,
}

/// Copies everything readable from `fd` onto `w` through a fixed buffer.
fn copy_fd(w: &mut impl Write, fd: libc::c_int) -> Result<Copied, EmitterError> {
    const BUFFER_LEN: usize = 512;
    let mut buffer = [0u8; BUFFER_LEN];
    // An empty file needs no terminating newline.
    let mut ends_with_newline = true;
    loop {
        // SAFETY: `buffer` is valid for BUFFER_LEN bytes.
        let read_count =
            unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, BUFFER_LEN) };
        if read_count < 0 && errno::errno().0 == libc::EINTR {
            continue;
        }
        if read_count <= 0 {
            break;
        }
        let chunk = &buffer[..read_count as usize];
        w.write_all(chunk)?;
        ends_with_newline = chunk.last() == Some(&b'\n');
    }
    Ok(Copied { ends_with_newline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::platform::Registers;
    use std::str;

    fn sample_context() -> CrashContext {
        let mut ctx = CrashContext::new(libc::SIGSEGV);
        ctx.si_code = 1;
        ctx.si_addr = Some(0);
        ctx.registers = Some(Registers {
            ip: 0x5555_0000_1234,
            sp: 0x7ffc_0000_0100,
            fp: 0x7ffc_0000_0180,
        });
        ctx.push_frame(RawFrame {
            ip: 0x5555_0000_1234,
            sp: 0x7ffc_0000_0100,
            bp: 0x7ffc_0000_0180,
        });
        ctx.push_frame(RawFrame {
            ip: 0x5555_0000_5678,
            sp: 0x7ffc_0000_0190,
            bp: 0,
        });
        ctx
    }

    #[test]
    fn test_emit_siginfo() {
        let ctx = sample_context();
        let mut buf = Vec::new();
        emit_siginfo(&mut buf, &ctx).expect("to work ;-)");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CRASHCATCH_BEGIN_SIGINFO);
        assert_eq!(lines[2], CRASHCATCH_END_SIGINFO);
        let json: serde_json::Value = serde_json::from_str(lines[1]).expect("valid json");
        assert_eq!(json["si_signo"], libc::SIGSEGV);
        assert_eq!(json["si_signo_human_readable"], "SIGSEGV");
        assert_eq!(json["si_code_human_readable"], "SEGV_MAPERR");
        assert_eq!(json["si_code_description"], "address not mapped to object");
        assert_eq!(json["si_errno"], 0);
        assert_eq!(json["si_addr"], "0x0000000000000000");
        assert!(json.get("si_pid").is_none());
    }

    #[test]
    fn test_emit_siginfo_user_sent() {
        let mut ctx = CrashContext::new(libc::SIGABRT);
        ctx.si_pid = Some(1234);
        let mut buf = Vec::new();
        emit_siginfo(&mut buf, &ctx).expect("to work ;-)");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");
        let json: serde_json::Value =
            serde_json::from_str(out.lines().nth(1).unwrap()).expect("valid json");
        assert_eq!(json["si_signo_human_readable"], "SIGABRT");
        assert_eq!(json["si_pid"], 1234);
        assert!(json.get("si_addr").is_none());
    }

    #[test]
    fn test_emit_ucontext_skipped_without_registers() {
        let ctx = CrashContext::new(libc::SIGABRT);
        let mut buf = Vec::new();
        emit_ucontext(&mut buf, &ctx).expect("to work ;-)");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_emit_stacktrace() {
        let ctx = sample_context();
        let mut buf = Vec::new();
        emit_stacktrace(&mut buf, ctx.frames(), ctx.truncated).expect("to work ;-)");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[1],
            "{\"ip\": \"0x0000555500001234\", \"sp\": \"0x00007ffc00000100\", \"fp\": \"0x00007ffc00000180\"}"
        );
        assert_eq!(
            lines[2],
            "{\"ip\": \"0x0000555500005678\", \"sp\": \"0x00007ffc00000190\"}"
        );
    }

    #[test]
    fn test_emit_siginfo_errno() {
        let mut ctx = sample_context();
        ctx.si_errno = libc::EIO;
        let mut buf = Vec::new();
        emit_siginfo(&mut buf, &ctx).expect("to work ;-)");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");
        let json: serde_json::Value =
            serde_json::from_str(out.lines().nth(1).unwrap()).expect("valid json");
        assert_eq!(json["si_errno"], libc::EIO);
    }

    #[test]
    fn test_emit_stacktrace_truncated() {
        let mut ctx = sample_context();
        ctx.truncated = true;
        let mut buf = Vec::new();
        emit_stacktrace(&mut buf, ctx.frames(), ctx.truncated).expect("to work ;-)");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[3], CRASHCATCH_STACKTRACE_TRUNCATED);
        assert_eq!(lines[4], CRASHCATCH_END_STACKTRACE);
    }

    #[test]
    fn test_emit_crashreport_order() {
        let mut ctx = sample_context();
        let mut config = CrashCatcherConfiguration::default();
        config.set_stacktrace(StacktraceCollection::FramePointers);
        let mut buf = Vec::new();
        emit_crashreport(&mut buf, &mut ctx, &config).expect("to work ;-)");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");

        let position = |marker: &str| {
            out.lines()
                .position(|l| l.starts_with(marker))
                .unwrap_or_else(|| panic!("{marker} missing from {out}"))
        };
        assert_eq!(position(CRASHCATCH_BEGIN_REPORT), 0);
        assert!(position(CRASHCATCH_BEGIN_SIGINFO) < position(CRASHCATCH_BEGIN_PROCINFO));
        assert!(position(CRASHCATCH_BEGIN_PROCINFO) < position(CRASHCATCH_BEGIN_UCONTEXT));
        assert!(position(CRASHCATCH_BEGIN_UCONTEXT) < position(CRASHCATCH_BEGIN_STACKTRACE));
        assert_eq!(out.lines().last(), Some(CRASHCATCH_DONE));
        // The frames pushed above were kept, not replaced by a walk of the test's own stack.
        assert!(out.contains("0x0000555500005678"));
    }

    #[test]
    fn test_emit_crashreport_stacktrace_disabled() {
        let mut ctx = sample_context();
        let mut config = CrashCatcherConfiguration::default();
        config.set_stacktrace(StacktraceCollection::Disabled);
        let mut buf = Vec::new();
        emit_crashreport(&mut buf, &mut ctx, &config).expect("to work ;-)");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");
        assert!(!out.contains(CRASHCATCH_BEGIN_STACKTRACE));
        assert!(out.contains(CRASHCATCH_BEGIN_SIGINFO));
        assert!(out.ends_with(&format!("{CRASHCATCH_DONE}\n")));
    }

    #[test]
    fn test_write_decimal() {
        let mut buf = [0u8; 8];
        assert_eq!(write_decimal(&mut buf, 0), Some(1));
        assert_eq!(&buf[..1], b"0");
        assert_eq!(write_decimal(&mut buf, 4242), Some(4));
        assert_eq!(&buf[..4], b"4242");
        assert_eq!(write_decimal(&mut buf[..2], 4242), None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    #[cfg_attr(miri, ignore)]
    fn test_emit_thread_name() {
        let tid = crate::collector::platform::current_tid();
        let mut buf = Vec::new();

        emit_thread_name(&mut buf, tid).expect("thread name to emit");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");
        assert!(out.starts_with(CRASHCATCH_BEGIN_THREAD_NAME));
        assert!(out.ends_with(&format!("{CRASHCATCH_END_THREAD_NAME}\n")));

        let comm = std::fs::read_to_string(format!("/proc/self/task/{tid}/comm")).expect("comm");
        let comm_trimmed = comm.trim_end_matches('\n');
        assert!(
            out.contains(comm_trimmed),
            "output should include thread name from comm; got {out:?}"
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_emit_text_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "line one\nline two").unwrap();
        let path = std::ffi::CString::new(file.path().as_os_str().as_encoded_bytes()).unwrap();
        let path_str = file.path().to_str().unwrap();

        let mut buf = Vec::new();
        emit_text_file(&mut buf, &path).expect("to work ;-)");
        let out = str::from_utf8(&buf).expect("to be valid UTF8");
        assert_eq!(
            out,
            format!(
                "{CRASHCATCH_BEGIN_FILE} {path_str}\nline one\nline two\n{CRASHCATCH_END_FILE} {path_str}\n"
            )
        );
    }

    #[test]
    fn test_emit_text_file_missing_is_skipped() {
        let mut buf = Vec::new();
        emit_text_file(&mut buf, c"/nonexistent/crashcatch/file").expect("to work ;-)");
        assert!(buf.is_empty());
    }
}
