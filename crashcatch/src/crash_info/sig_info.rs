// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si_addr: Option<String>,
    pub si_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si_code_description: Option<String>,
    pub si_code_human_readable: SiCodes,
    /// Errno value the kernel attached to the signal, usually 0.
    #[serde(default)]
    pub si_errno: i32,
    /// Pid of the sender, for signals sent with `kill`/`raise`/`sigqueue`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si_pid: Option<i32>,
    pub si_signo: i32,
    pub si_signo_human_readable: SignalNames,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[repr(C)]
/// See <https://man7.org/linux/man-pages/man7/signal.7.html>
pub enum SignalNames {
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGILL,
    SIGTRAP,
    SIGABRT,
    SIGBUS,
    SIGFPE,
    SIGKILL,
    SIGUSR1,
    SIGSEGV,
    SIGUSR2,
    SIGPIPE,
    SIGALRM,
    SIGTERM,
    SIGCHLD,
    SIGSYS,
    SIGXCPU,
    SIGXFSZ,
    UNKNOWN,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[repr(C)]
/// See <https://man7.org/linux/man-pages/man2/sigaction.2.html>
pub enum SiCodes {
    BUS_ADRALN,
    BUS_ADRERR,
    BUS_OBJERR,
    FPE_FLTDIV,
    FPE_FLTINV,
    FPE_FLTOVF,
    FPE_FLTRES,
    FPE_FLTSUB,
    FPE_FLTUND,
    FPE_INTDIV,
    FPE_INTOVF,
    ILL_BADSTK,
    ILL_COPROC,
    ILL_ILLADR,
    ILL_ILLOPC,
    ILL_ILLOPN,
    ILL_ILLTRP,
    ILL_PRVOPC,
    ILL_PRVREG,
    SEGV_ACCERR,
    SEGV_BNDERR,
    SEGV_MAPERR,
    SEGV_PKUERR,
    SI_ASYNCIO,
    SI_KERNEL,
    SI_MESGQ,
    SI_QUEUE,
    SI_TIMER,
    SI_TKILL,
    SI_USER,
    SYS_SECCOMP,
    TRAP_BRKPT,
    TRAP_TRACE,
    UNKNOWN,
}

impl SiCodes {
    /// A short human readable description of the code.
    pub fn description(self) -> &'static str {
        match self {
            SiCodes::BUS_ADRALN => "invalid address alignment",
            SiCodes::BUS_ADRERR => "nonexistent physical address",
            SiCodes::BUS_OBJERR => "object-specific hardware error",
            SiCodes::FPE_FLTDIV => "floating-point divide by zero",
            SiCodes::FPE_FLTINV => "invalid floating-point operation",
            SiCodes::FPE_FLTOVF => "floating-point overflow",
            SiCodes::FPE_FLTRES => "floating-point inexact result",
            SiCodes::FPE_FLTSUB => "subscript out of range",
            SiCodes::FPE_FLTUND => "floating-point underflow",
            SiCodes::FPE_INTDIV => "integer divide by zero",
            SiCodes::FPE_INTOVF => "integer overflow",
            SiCodes::ILL_BADSTK => "internal stack error",
            SiCodes::ILL_COPROC => "coprocessor error",
            SiCodes::ILL_ILLADR => "illegal addressing mode",
            SiCodes::ILL_ILLOPC => "illegal opcode",
            SiCodes::ILL_ILLOPN => "illegal operand",
            SiCodes::ILL_ILLTRP => "illegal trap",
            SiCodes::ILL_PRVOPC => "privileged opcode",
            SiCodes::ILL_PRVREG => "privileged register",
            SiCodes::SEGV_ACCERR => "invalid permissions for mapped object",
            SiCodes::SEGV_BNDERR => "failed address bound checks",
            SiCodes::SEGV_MAPERR => "address not mapped to object",
            SiCodes::SEGV_PKUERR => "access denied by memory protection keys",
            SiCodes::SI_ASYNCIO => "AIO completed",
            SiCodes::SI_KERNEL => "sent by the kernel",
            SiCodes::SI_MESGQ => "POSIX message queue state changed",
            SiCodes::SI_QUEUE => "sent by sigqueue",
            SiCodes::SI_TIMER => "POSIX timer expired",
            SiCodes::SI_TKILL => "sent by tkill or tgkill",
            SiCodes::SI_USER => "sent by kill or raise",
            SiCodes::SYS_SECCOMP => "triggered by a seccomp filter",
            SiCodes::TRAP_BRKPT => "process breakpoint",
            SiCodes::TRAP_TRACE => "process trace trap",
            SiCodes::UNKNOWN => "unknown",
        }
    }
}

#[cfg(unix)]
pub use unix::*;

#[cfg(unix)]
mod unix {
    use super::*;

    impl From<libc::c_int> for SignalNames {
        fn from(value: libc::c_int) -> Self {
            match value {
                libc::SIGHUP => SignalNames::SIGHUP,
                libc::SIGINT => SignalNames::SIGINT,
                libc::SIGQUIT => SignalNames::SIGQUIT,
                libc::SIGILL => SignalNames::SIGILL,
                libc::SIGTRAP => SignalNames::SIGTRAP,
                libc::SIGABRT => SignalNames::SIGABRT,
                libc::SIGBUS => SignalNames::SIGBUS,
                libc::SIGFPE => SignalNames::SIGFPE,
                libc::SIGKILL => SignalNames::SIGKILL,
                libc::SIGUSR1 => SignalNames::SIGUSR1,
                libc::SIGSEGV => SignalNames::SIGSEGV,
                libc::SIGUSR2 => SignalNames::SIGUSR2,
                libc::SIGPIPE => SignalNames::SIGPIPE,
                libc::SIGALRM => SignalNames::SIGALRM,
                libc::SIGTERM => SignalNames::SIGTERM,
                libc::SIGCHLD => SignalNames::SIGCHLD,
                libc::SIGSYS => SignalNames::SIGSYS,
                libc::SIGXCPU => SignalNames::SIGXCPU,
                libc::SIGXFSZ => SignalNames::SIGXFSZ,
                _ => SignalNames::UNKNOWN,
            }
        }
    }

    // These are defined in siginfo.h.
    // They are derived here because there doesn't appear to be a crate that provides them in a
    // comparable way across platforms.  Linux and Darwin disagree on several of the values.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    mod code {
        pub const SI_USER: i32 = 0;
        pub const SI_KERNEL: i32 = 0x80;
        pub const SI_QUEUE: i32 = -1;
        pub const SI_TIMER: i32 = -2;
        pub const SI_MESGQ: i32 = -3;
        pub const SI_ASYNCIO: i32 = -4;
        pub const SI_TKILL: i32 = -6;

        pub const ILL_ILLOPC: i32 = 1;
        pub const ILL_ILLOPN: i32 = 2;
        pub const ILL_ILLADR: i32 = 3;
        pub const ILL_ILLTRP: i32 = 4;
        pub const ILL_PRVOPC: i32 = 5;
        pub const ILL_PRVREG: i32 = 6;
        pub const ILL_COPROC: i32 = 7;
        pub const ILL_BADSTK: i32 = 8;

        pub const FPE_INTDIV: i32 = 1;
        pub const FPE_INTOVF: i32 = 2;
        pub const FPE_FLTDIV: i32 = 3;
        pub const FPE_FLTOVF: i32 = 4;
        pub const FPE_FLTUND: i32 = 5;
        pub const FPE_FLTRES: i32 = 6;
        pub const FPE_FLTINV: i32 = 7;
        pub const FPE_FLTSUB: i32 = 8;

        pub const SEGV_MAPERR: i32 = 1;
        pub const SEGV_ACCERR: i32 = 2;
        pub const SEGV_BNDERR: i32 = 3;
        pub const SEGV_PKUERR: i32 = 4;
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    mod code {
        pub const SI_USER: i32 = 0x10001;
        pub const SI_QUEUE: i32 = 0x10002;
        pub const SI_TIMER: i32 = 0x10003;
        pub const SI_ASYNCIO: i32 = 0x10004;
        pub const SI_MESGQ: i32 = 0x10005;

        pub const ILL_ILLOPC: i32 = 1;
        pub const ILL_ILLTRP: i32 = 2;
        pub const ILL_PRVOPC: i32 = 3;
        pub const ILL_ILLOPN: i32 = 4;
        pub const ILL_ILLADR: i32 = 5;
        pub const ILL_PRVREG: i32 = 6;
        pub const ILL_COPROC: i32 = 7;
        pub const ILL_BADSTK: i32 = 8;

        pub const FPE_FLTDIV: i32 = 1;
        pub const FPE_FLTOVF: i32 = 2;
        pub const FPE_FLTUND: i32 = 3;
        pub const FPE_FLTRES: i32 = 4;
        pub const FPE_FLTINV: i32 = 5;
        pub const FPE_FLTSUB: i32 = 6;
        pub const FPE_INTDIV: i32 = 7;
        pub const FPE_INTOVF: i32 = 8;

        pub const SEGV_MAPERR: i32 = 1;
        pub const SEGV_ACCERR: i32 = 2;
    }

    const BUS_ADRALN: i32 = 1;
    const BUS_ADRERR: i32 = 2;
    const BUS_OBJERR: i32 = 3;
    const TRAP_BRKPT: i32 = 1;
    const TRAP_TRACE: i32 = 2;
    const SYS_SECCOMP: i32 = 1;

    /// Maps a `(si_signo, si_code)` pair onto its symbolic name.
    ///
    /// SIGNAL SAFETY:
    ///     Pure function over integers, safe to call from a signal handler.
    pub fn translate_si_code(signum: libc::c_int, si_code: libc::c_int) -> SiCodes {
        // Codes that mean "sent by someone" apply to every signal.
        if let Some(generic) = translate_generic_code(si_code) {
            return generic;
        }
        match signum {
            libc::SIGILL => match si_code {
                code::ILL_ILLOPC => SiCodes::ILL_ILLOPC,
                code::ILL_ILLOPN => SiCodes::ILL_ILLOPN,
                code::ILL_ILLADR => SiCodes::ILL_ILLADR,
                code::ILL_ILLTRP => SiCodes::ILL_ILLTRP,
                code::ILL_PRVOPC => SiCodes::ILL_PRVOPC,
                code::ILL_PRVREG => SiCodes::ILL_PRVREG,
                code::ILL_COPROC => SiCodes::ILL_COPROC,
                code::ILL_BADSTK => SiCodes::ILL_BADSTK,
                _ => SiCodes::UNKNOWN,
            },
            libc::SIGFPE => match si_code {
                code::FPE_INTDIV => SiCodes::FPE_INTDIV,
                code::FPE_INTOVF => SiCodes::FPE_INTOVF,
                code::FPE_FLTDIV => SiCodes::FPE_FLTDIV,
                code::FPE_FLTOVF => SiCodes::FPE_FLTOVF,
                code::FPE_FLTUND => SiCodes::FPE_FLTUND,
                code::FPE_FLTRES => SiCodes::FPE_FLTRES,
                code::FPE_FLTINV => SiCodes::FPE_FLTINV,
                code::FPE_FLTSUB => SiCodes::FPE_FLTSUB,
                _ => SiCodes::UNKNOWN,
            },
            libc::SIGSEGV => match si_code {
                code::SEGV_MAPERR => SiCodes::SEGV_MAPERR,
                code::SEGV_ACCERR => SiCodes::SEGV_ACCERR,
                #[cfg(any(target_os = "linux", target_os = "android"))]
                code::SEGV_BNDERR => SiCodes::SEGV_BNDERR,
                #[cfg(any(target_os = "linux", target_os = "android"))]
                code::SEGV_PKUERR => SiCodes::SEGV_PKUERR,
                _ => SiCodes::UNKNOWN,
            },
            libc::SIGBUS => match si_code {
                BUS_ADRALN => SiCodes::BUS_ADRALN,
                BUS_ADRERR => SiCodes::BUS_ADRERR,
                BUS_OBJERR => SiCodes::BUS_OBJERR,
                _ => SiCodes::UNKNOWN,
            },
            libc::SIGTRAP => match si_code {
                TRAP_BRKPT => SiCodes::TRAP_BRKPT,
                TRAP_TRACE => SiCodes::TRAP_TRACE,
                _ => SiCodes::UNKNOWN,
            },
            libc::SIGSYS => match si_code {
                SYS_SECCOMP => SiCodes::SYS_SECCOMP,
                _ => SiCodes::UNKNOWN,
            },
            _ => SiCodes::UNKNOWN,
        }
    }

    fn translate_generic_code(si_code: libc::c_int) -> Option<SiCodes> {
        match si_code {
            code::SI_USER => Some(SiCodes::SI_USER),
            code::SI_QUEUE => Some(SiCodes::SI_QUEUE),
            code::SI_TIMER => Some(SiCodes::SI_TIMER),
            code::SI_MESGQ => Some(SiCodes::SI_MESGQ),
            code::SI_ASYNCIO => Some(SiCodes::SI_ASYNCIO),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            code::SI_KERNEL => Some(SiCodes::SI_KERNEL),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            code::SI_TKILL => Some(SiCodes::SI_TKILL),
            _ => None,
        }
    }

    /// Whether `si_code` says the signal was sent by a process (kill, raise, sigqueue, tkill)
    /// rather than generated by a fault.  Such signals are not re-delivered when the handler
    /// returns, so they have to be raised again to reach the previous disposition.
    pub fn is_user_sent(si_code: libc::c_int) -> bool {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            si_code <= 0
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            si_code == code::SI_USER || si_code == code::SI_QUEUE
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_si_code() {
            // standard values differ between oses, but segv matches
            // https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/siginfo.h
            // https://github.com/apple/darwin-xnu/blob/main/bsd/sys/signal.h
            assert_eq!(translate_si_code(libc::SIGSEGV, 1), SiCodes::SEGV_MAPERR);
            assert_eq!(translate_si_code(libc::SIGSEGV, 2), SiCodes::SEGV_ACCERR);
            assert_eq!(translate_si_code(libc::SIGBUS, 1), SiCodes::BUS_ADRALN);
            assert_eq!(translate_si_code(libc::SIGSEGV, 4242), SiCodes::UNKNOWN);
            assert_eq!(
                translate_si_code(libc::SIGABRT, code::SI_USER),
                SiCodes::SI_USER
            );
            assert_eq!(
                translate_si_code(libc::SIGFPE, code::FPE_INTDIV),
                SiCodes::FPE_INTDIV
            );
        }

        #[test]
        #[cfg(any(target_os = "linux", target_os = "android"))]
        fn test_si_code_linux() {
            assert_eq!(translate_si_code(libc::SIGSEGV, 0x80), SiCodes::SI_KERNEL);
            assert_eq!(translate_si_code(libc::SIGABRT, -6), SiCodes::SI_TKILL);
            assert_eq!(translate_si_code(libc::SIGILL, 1), SiCodes::ILL_ILLOPC);
            assert_eq!(translate_si_code(libc::SIGFPE, 1), SiCodes::FPE_INTDIV);
            assert!(is_user_sent(-6));
            assert!(is_user_sent(0));
            assert!(!is_user_sent(1));
            assert!(!is_user_sent(0x80));
        }

        #[test]
        fn test_signal_names() {
            assert_eq!(SignalNames::from(libc::SIGSEGV), SignalNames::SIGSEGV);
            assert_eq!(SignalNames::from(libc::SIGABRT), SignalNames::SIGABRT);
            assert_eq!(SignalNames::from(12345), SignalNames::UNKNOWN);
        }

        #[test]
        fn test_descriptions() {
            assert_eq!(
                SiCodes::SEGV_MAPERR.description(),
                "address not mapped to object"
            );
            assert_eq!(SiCodes::FPE_INTDIV.description(), "integer divide by zero");
        }
    }
}
