// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Platform specific accessors used on the crash path.
//!
//! Everything in here is async-signal safe: register reads from the `ucontext`, plain syscalls,
//! and memory reads that are validated by the kernel where the platform allows it.

use libc::ucontext_t;

/// Register values of the interrupted frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Registers {
    /// Instruction pointer (RIP on x86_64, PC on aarch64)
    pub ip: usize,
    /// Stack pointer (RSP on x86_64, SP on aarch64)
    pub sp: usize,
    /// Frame pointer (RBP on x86_64, X29 on aarch64)
    pub fp: usize,
}

/// Extracts the registers of the faulting frame.  Returns `None` for a null context or on
/// architectures we don't know how to decode.
///
/// # Safety
/// `ucontext` must be null or the context pointer handed to a `SA_SIGINFO` handler.
#[allow(unreachable_code)]
pub(crate) unsafe fn registers_from_ucontext(ucontext: *const ucontext_t) -> Option<Registers> {
    if ucontext.is_null() {
        return None;
    }

    #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))]
    {
        let gregs = &(*ucontext).uc_mcontext.gregs;
        return Some(Registers {
            ip: gregs[libc::REG_RIP as usize] as usize,
            sp: gregs[libc::REG_RSP as usize] as usize,
            fp: gregs[libc::REG_RBP as usize] as usize,
        });
    }

    #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "aarch64"))]
    {
        let mcontext = &(*ucontext).uc_mcontext;
        return Some(Registers {
            ip: mcontext.pc as usize,
            sp: mcontext.sp as usize,
            fp: mcontext.regs[29] as usize,
        });
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    {
        // On MacOS, the actual machine context is behind a second pointer.
        let mcontext = (*ucontext).uc_mcontext;
        if mcontext.is_null() {
            return None;
        }
        let ss = &(*mcontext).__ss;
        return Some(Registers {
            ip: ss.__rip as usize,
            sp: ss.__rsp as usize,
            fp: ss.__rbp as usize,
        });
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        let mcontext = (*ucontext).uc_mcontext;
        if mcontext.is_null() {
            return None;
        }
        let ss = &(*mcontext).__ss;
        return Some(Registers {
            ip: ss.__pc as usize,
            sp: ss.__sp as usize,
            fp: ss.__fp as usize,
        });
    }

    None
}

/// Kernel id of the calling thread.
pub(crate) fn current_tid() -> u64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: gettid has no preconditions and cannot fail.
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }
    #[cfg(target_os = "macos")]
    {
        let mut tid: u64 = 0;
        // SAFETY: a null thread means the calling thread; tid is a valid out pointer.
        unsafe { libc::pthread_threadid_np(0, &mut tid) };
        tid
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    {
        // SAFETY: No preconditions.
        unsafe { libc::pthread_self() as u64 }
    }
}

/// Addresses below this are never valid frame addresses.
const MIN_VALID_ADDRESS: usize = 4096;

/// Reads one machine word from `addr` without faulting on unmapped memory, where possible.
///
/// On Linux the read goes through `process_vm_readv(2)` on our own pid: an unmapped address
/// yields `EFAULT` instead of a SIGSEGV.  If the syscall is unavailable (seccomp, old kernels),
/// or on other platforms, the read is a plain volatile load; a fault there re-enters the handler,
/// whose one-shot guard turns it into a chain to the previous handler.
pub(crate) fn read_word(addr: usize) -> Option<usize> {
    if addr < MIN_VALID_ADDRESS || addr % std::mem::align_of::<usize>() != 0 {
        return None;
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut value: usize = 0;
        let local = libc::iovec {
            iov_base: &mut value as *mut usize as *mut libc::c_void,
            iov_len: std::mem::size_of::<usize>(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: std::mem::size_of::<usize>(),
        };
        // SAFETY: both iovecs describe one word; the local one points at `value`.
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if read == std::mem::size_of::<usize>() as isize {
            return Some(value);
        }
        match errno::errno().0 {
            libc::ENOSYS | libc::EPERM => {}
            _ => return None,
        }
    }

    // SAFETY: best effort, see above.
    Some(unsafe { std::ptr::read_volatile(addr as *const usize) })
}
