// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// How the test binary sets up crash catching before it crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestMode {
    /// `install()` configured from the environment.
    Default,
    /// A handler installed before crashcatch must still run after the report is written.
    Prechain,
    /// The prechained handler faults again; only one report may come out.
    PrechainReentrant,
    /// A second install with another sink changes nothing.
    DoubleInstall,
    /// No alternate signal stack.
    NoAltStack,
    /// `disable()` before the crash: no report, same termination.
    Disabled,
    /// Installed and crashed through the C entry points.
    Ffi,
    /// The signal was ignored before install and is sent by the process itself.
    IgnoredUserSignal,
    /// The prechained handler was installed with `SA_RESETHAND` and re-raises the signal.
    PrechainResetHand,
    /// SIGSEGV is ignored and raised once before the real fault.
    IgnoredThenFault,
    /// The report goes to a pipe nobody reads, so writing it raises SIGPIPE mid-capture.
    BrokenSink,
}

impl TestMode {
    /// Returns the string representation used in command-line arguments.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Prechain => "prechain",
            Self::PrechainReentrant => "prechain_reentrant",
            Self::DoubleInstall => "double_install",
            Self::NoAltStack => "no_altstack",
            Self::Disabled => "disabled",
            Self::Ffi => "ffi",
            Self::IgnoredUserSignal => "ignored_user_signal",
            Self::PrechainResetHand => "prechain_resethand",
            Self::IgnoredThenFault => "ignored_then_fault",
            Self::BrokenSink => "broken_sink",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::Default,
            Self::Prechain,
            Self::PrechainReentrant,
            Self::DoubleInstall,
            Self::NoAltStack,
            Self::Disabled,
            Self::Ffi,
            Self::IgnoredUserSignal,
            Self::PrechainResetHand,
            Self::IgnoredThenFault,
            Self::BrokenSink,
        ]
    }

    /// Whether a report is expected in the configured sink.
    pub const fn expects_report(self) -> bool {
        !matches!(
            self,
            Self::Disabled | Self::IgnoredUserSignal | Self::BrokenSink
        )
    }
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("Unknown test mode: {s}"))
    }
}

/// How the test binary crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashType {
    /// `crashcatch::trigger_fault()`, a load from address 0.
    TriggerFault,
    RaiseSigAbrt,
    RaiseSigBus,
    RaiseSigFpe,
    RaiseSigIll,
    RaiseSigSegv,
    /// Unbounded recursion on the main thread.
    StackOverflow,
}

impl CrashType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TriggerFault => "trigger_fault",
            Self::RaiseSigAbrt => "raise_sigabrt",
            Self::RaiseSigBus => "raise_sigbus",
            Self::RaiseSigFpe => "raise_sigfpe",
            Self::RaiseSigIll => "raise_sigill",
            Self::RaiseSigSegv => "raise_sigsegv",
            Self::StackOverflow => "stack_overflow",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::TriggerFault,
            Self::RaiseSigAbrt,
            Self::RaiseSigBus,
            Self::RaiseSigFpe,
            Self::RaiseSigIll,
            Self::RaiseSigSegv,
            Self::StackOverflow,
        ]
    }

    /// The signal the process is expected to die from.
    pub const fn signal(self) -> libc::c_int {
        match self {
            Self::TriggerFault | Self::RaiseSigSegv | Self::StackOverflow => libc::SIGSEGV,
            Self::RaiseSigAbrt => libc::SIGABRT,
            Self::RaiseSigBus => libc::SIGBUS,
            Self::RaiseSigFpe => libc::SIGFPE,
            Self::RaiseSigIll => libc::SIGILL,
        }
    }

    /// Whether the kernel raised the signal for a fault, as opposed to the process sending it.
    pub const fn is_fault(self) -> bool {
        matches!(self, Self::TriggerFault | Self::StackOverflow)
    }
}

impl std::fmt::Display for CrashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CrashType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown crash type: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for mode in TestMode::all() {
            assert_eq!(mode.as_str().parse::<TestMode>(), Ok(*mode));
        }
        for crash in CrashType::all() {
            assert_eq!(crash.to_string().parse::<CrashType>(), Ok(*crash));
        }
    }

    #[test]
    fn test_expects_report() {
        assert!(TestMode::PrechainResetHand.expects_report());
        assert!(TestMode::IgnoredThenFault.expects_report());
        assert!(!TestMode::BrokenSink.expects_report());
        assert!(!TestMode::Disabled.expects_report());
    }

    #[test]
    fn test_unknown_names() {
        assert!("segfault".parse::<CrashType>().is_err());
        assert!("".parse::<TestMode>().is_err());
    }
}
