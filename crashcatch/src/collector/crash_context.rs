// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::frame_pointer_walker::{walk_frame_pointers, RawFrame};
use super::platform::{current_tid, registers_from_ucontext, Registers};
use crate::shared::constants::MAX_BACKTRACE_FRAMES;
use crate::StacktraceCollection;
use libc::{siginfo_t, ucontext_t};

/// Everything the crash handler knows about a fault, captured into plain values before anything
/// is written out.
///
/// The struct lives on the (alternate) signal stack, so it is `Copy`, fixed size, and holds no
/// heap data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CrashContext {
    pub signum: i32,
    pub si_code: i32,
    pub si_errno: i32,
    /// Faulting address, for the signals that carry one.
    pub si_addr: Option<usize>,
    /// Sender pid, for signals sent by a process.
    pub si_pid: Option<i32>,
    pub pid: u32,
    pub tid: u64,
    pub registers: Option<Registers>,
    /// True if the walk filled `frames` to capacity.
    pub truncated: bool,
    frames: [RawFrame; MAX_BACKTRACE_FRAMES],
    num_frames: usize,
    frames_collected: bool,
}

impl CrashContext {
    /// Captures the context of the signal being handled.
    ///
    /// SAFETY:
    ///     `sig_info` and `ucontext` must be null or the pointers handed to a `SA_SIGINFO` handler.
    /// SIGNAL SAFETY:
    ///     Only field and register reads, `getpid`, and `gettid`.
    pub unsafe fn capture(
        signum: i32,
        sig_info: *const siginfo_t,
        ucontext: *const ucontext_t,
    ) -> Self {
        let mut ctx = Self::new(signum);
        if !sig_info.is_null() {
            ctx.signum = (*sig_info).si_signo;
            ctx.si_code = (*sig_info).si_code;
            ctx.si_errno = (*sig_info).si_errno;
            // https://man7.org/linux/man-pages/man2/sigaction.2.html
            // SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the address of the
            // fault.
            ctx.si_addr = match ctx.signum {
                libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
                    Some((*sig_info).si_addr() as usize)
                }
                _ => None,
            };
            if crate::is_user_sent(ctx.si_code) {
                ctx.si_pid = Some((*sig_info).si_pid());
            }
        }
        ctx.registers = registers_from_ucontext(ucontext);
        ctx
    }

    /// Takes the stack snapshot.  Kept apart from [`Self::capture`] so the signal, address and
    /// thread can be written out before touching memory that may be corrupted.
    ///
    /// Only the first call walks the stack.
    pub fn collect_frames(&mut self, stacktrace: StacktraceCollection) {
        if self.frames_collected {
            return;
        }
        self.frames_collected = true;
        match stacktrace {
            StacktraceCollection::Disabled => {}
            StacktraceCollection::FramePointers => {
                if let Some(regs) = self.registers {
                    self.num_frames = walk_frame_pointers(&regs, &mut self.frames);
                }
            }
            StacktraceCollection::Unwinder => {
                let fault_ip = self.registers.map(|r| r.ip).unwrap_or_default();
                self.num_frames = collect_with_unwinder(fault_ip, &mut self.frames);
            }
        }
        self.truncated = self.num_frames == MAX_BACKTRACE_FRAMES;
    }

    /// An empty context for `signum`, with pid and tid of the calling thread.
    pub fn new(signum: i32) -> Self {
        Self {
            signum,
            si_code: 0,
            si_errno: 0,
            si_addr: None,
            si_pid: None,
            // SAFETY: No preconditions.
            pid: unsafe { libc::getpid() } as u32,
            tid: current_tid(),
            registers: None,
            truncated: false,
            frames: [RawFrame::default(); MAX_BACKTRACE_FRAMES],
            num_frames: 0,
            frames_collected: false,
        }
    }

    pub fn frames(&self) -> &[RawFrame] {
        &self.frames[..self.num_frames]
    }

    #[cfg(test)]
    pub fn push_frame(&mut self, frame: RawFrame) {
        self.frames_collected = true;
        if self.num_frames < MAX_BACKTRACE_FRAMES {
            self.frames[self.num_frames] = frame;
            self.num_frames += 1;
        }
    }
}

/// Collects frames with the `backtrace` crate's unwinder.
///
/// Frames belonging to the handler itself are skipped until `fault_ip` shows up; if it never
/// does, the walk is repeated and everything is kept.
///
/// SIGNAL SAFETY:
///     Getting a backtrace on rust is not guaranteed to be signal safe.
///     https://github.com/rust-lang/backtrace-rs/issues/414
///     Only instruction and stack pointers are read, frames are never resolved to symbols.
fn collect_with_unwinder(fault_ip: usize, frames: &mut [RawFrame]) -> usize {
    let mut count = 0;
    let mut ip_found = fault_ip == 0;
    loop {
        // SAFETY: the one-shot guard in the crash handler serializes access.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if ip == fault_ip {
                    ip_found = true;
                }
                if !ip_found {
                    return true;
                }
                if count >= frames.len() {
                    return false;
                }
                frames[count] = RawFrame {
                    ip,
                    sp: frame.sp() as usize,
                    bp: 0,
                };
                count += 1;
                true
            })
        };
        if ip_found {
            break;
        }
        ip_found = true;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_without_siginfo() {
        let mut ctx =
            unsafe { CrashContext::capture(libc::SIGABRT, std::ptr::null(), std::ptr::null()) };
        ctx.collect_frames(StacktraceCollection::FramePointers);
        assert_eq!(ctx.signum, libc::SIGABRT);
        assert_eq!(ctx.si_addr, None);
        assert_eq!(ctx.registers, None);
        assert!(ctx.frames().is_empty());
        assert!(!ctx.truncated);
        assert_eq!(ctx.pid, std::process::id());
        assert_eq!(ctx.tid, current_tid());
    }

    #[test]
    fn test_capture_reads_siginfo() {
        let mut info: siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = libc::SIGBUS;
        info.si_code = 2;
        info.si_errno = libc::EIO;
        let ctx = unsafe { CrashContext::capture(libc::SIGSEGV, &info, std::ptr::null()) };
        assert_eq!(ctx.signum, libc::SIGBUS);
        assert_eq!(ctx.si_code, 2);
        assert_eq!(ctx.si_errno, libc::EIO);
        assert_eq!(ctx.si_addr, Some(0));
        assert_eq!(ctx.si_pid, None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_deep_stack_is_truncated() {
        #[inline(never)]
        fn nest(depth: usize, ctx: &mut CrashContext) {
            if depth == 0 {
                ctx.collect_frames(StacktraceCollection::Unwinder);
            } else {
                nest(depth - 1, ctx);
            }
            std::hint::black_box(depth);
        }
        let mut ctx = CrashContext::new(libc::SIGSEGV);
        nest(MAX_BACKTRACE_FRAMES * 2, &mut ctx);
        assert_eq!(ctx.frames().len(), MAX_BACKTRACE_FRAMES);
        assert!(ctx.truncated);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_collect_with_unwinder_keeps_everything_without_fault_ip() {
        let mut frames = [RawFrame::default(); MAX_BACKTRACE_FRAMES];
        let count = collect_with_unwinder(1, &mut frames);
        assert!(count > 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_collect_frames_once() {
        let mut ctx = CrashContext::new(libc::SIGSEGV);
        ctx.collect_frames(StacktraceCollection::Unwinder);
        let first = ctx.frames().len();
        assert!(first > 0);
        ctx.collect_frames(StacktraceCollection::Disabled);
        assert_eq!(ctx.frames().len(), first);
    }

    #[test]
    fn test_push_frame_caps() {
        let mut ctx = CrashContext::new(libc::SIGSEGV);
        for i in 0..MAX_BACKTRACE_FRAMES + 10 {
            ctx.push_frame(RawFrame {
                ip: i + 1,
                sp: 0,
                bp: 0,
            });
        }
        assert_eq!(ctx.frames().len(), MAX_BACKTRACE_FRAMES);
    }
}
