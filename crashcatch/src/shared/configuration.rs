// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::{default_signals, signal_from_signum};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

pub const ENV_SIGNALS: &str = "CRASHCATCH_SIGNALS";
pub const ENV_ALT_STACK: &str = "CRASHCATCH_ALT_STACK";
pub const ENV_STACKTRACE: &str = "CRASHCATCH_STACKTRACE";
pub const ENV_OUTPUT: &str = "CRASHCATCH_OUTPUT";
pub const ENV_MEMORY_MAPS: &str = "CRASHCATCH_MEMORY_MAPS";

/// Stacktrace collection occurs in the context of a crashing process.
/// If the stack is sufficiently corrupted, it is possible (but unlikely),
/// for stack trace collection itself to crash.  The one-shot guard in the handler turns such a
/// crash into a plain chain to the previous handler, so the report is merely cut short.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StacktraceCollection {
    Disabled,
    /// Walk the frame-pointer chain from the faulting frame.  Only register reads and
    /// validated memory reads are involved, which makes this the signal-safe choice.
    FramePointers,
    /// Use `backtrace::trace_unsynchronized()`.  Works without frame pointers, but the platform
    /// unwinder is not guaranteed to be async-signal safe.
    /// <https://github.com/rust-lang/backtrace-rs/issues/414>
    Unwinder,
}

impl std::str::FromStr for StacktraceCollection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            "frame_pointers" | "fp" => Ok(Self::FramePointers),
            "unwinder" => Ok(Self::Unwinder),
            other => anyhow::bail!("Unknown stacktrace collection mode: {other}"),
        }
    }
}

/// Where the crash report goes.  Whatever the variant, the handler only ever sees a raw file
/// descriptor: files are opened when crash catching is installed, never during a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportSink {
    Stderr,
    /// An already open descriptor owned by the embedding application.
    Fd(RawFd),
    /// A file, created if needed and opened in append mode.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashCatcherConfiguration {
    create_alt_stack: bool,
    include_memory_maps: bool,
    sink: ReportSink,
    signals: Vec<i32>,
    stacktrace: StacktraceCollection,
    use_alt_stack: bool,
}

impl Default for CrashCatcherConfiguration {
    fn default() -> Self {
        Self {
            create_alt_stack: true,
            include_memory_maps: cfg!(target_os = "linux"),
            sink: ReportSink::Stderr,
            signals: default_signals(),
            stacktrace: StacktraceCollection::FramePointers,
            use_alt_stack: true,
        }
    }
}

impl CrashCatcherConfiguration {
    pub fn new(
        create_alt_stack: bool,
        use_alt_stack: bool,
        stacktrace: StacktraceCollection,
        mut signals: Vec<i32>,
        sink: ReportSink,
        include_memory_maps: bool,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        if signals.is_empty() {
            signals = default_signals();
        } else {
            // Ensure we don't have double elements in the signals list.
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            signals
                .iter()
                .try_for_each(|x| signal_from_signum(*x).map(|_| ()))?;
            // SIGKILL and SIGSTOP cannot be caught; sigaction() would fail for them anyway, but
            // asking for them is a configuration mistake worth reporting early.
            anyhow::ensure!(
                !signals.contains(&libc::SIGKILL) && !signals.contains(&libc::SIGSTOP),
                "SIGKILL and SIGSTOP cannot be caught"
            );
        }
        if let ReportSink::Fd(fd) = sink {
            anyhow::ensure!(fd >= 0, "Invalid report file descriptor {fd}");
        }

        Ok(Self {
            create_alt_stack,
            include_memory_maps,
            sink,
            signals,
            stacktrace,
            use_alt_stack,
        })
    }

    /// Builds a configuration from the `CRASHCATCH_*` environment variables, starting from the
    /// defaults for anything that is not set.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_env_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_env_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let signals = match lookup(ENV_SIGNALS) {
            Some(v) => parse_signal_list(&v).with_context(|| format!("parsing {ENV_SIGNALS}"))?,
            None => defaults.signals,
        };
        let alt_stack = match lookup(ENV_ALT_STACK) {
            Some(v) => parse_bool(&v).with_context(|| format!("parsing {ENV_ALT_STACK}"))?,
            None => defaults.create_alt_stack,
        };
        let stacktrace = match lookup(ENV_STACKTRACE) {
            Some(v) => v.parse().with_context(|| format!("parsing {ENV_STACKTRACE}"))?,
            None => defaults.stacktrace,
        };
        let sink = match lookup(ENV_OUTPUT) {
            Some(v) if !v.trim().is_empty() => ReportSink::File(PathBuf::from(v.trim())),
            _ => defaults.sink,
        };
        let include_memory_maps = match lookup(ENV_MEMORY_MAPS) {
            Some(v) => parse_bool(&v).with_context(|| format!("parsing {ENV_MEMORY_MAPS}"))?,
            None => defaults.include_memory_maps,
        };

        Self::new(
            alt_stack,
            alt_stack,
            stacktrace,
            signals,
            sink,
            include_memory_maps,
        )
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn include_memory_maps(&self) -> bool {
        self.include_memory_maps
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn sink(&self) -> &ReportSink {
        &self.sink
    }

    pub fn stacktrace(&self) -> StacktraceCollection {
        self.stacktrace
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            use_alt_stack || !self.create_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_sink(&mut self, sink: ReportSink) {
        self.sink = sink;
    }

    pub fn set_stacktrace(&mut self, stacktrace: StacktraceCollection) {
        self.stacktrace = stacktrace;
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("Expected a boolean, got {other:?}"),
    }
}

/// Parses a comma separated list of signals, given either by name (`SIGSEGV`, `segv`) or number.
fn parse_signal_list(value: &str) -> anyhow::Result<Vec<i32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if let Ok(signum) = s.parse::<i32>() {
                return Ok(signum);
            }
            let upper = s.to_ascii_uppercase();
            let name = if upper.starts_with("SIG") {
                upper
            } else {
                format!("SIG{upper}")
            };
            name.parse::<nix::sys::signal::Signal>()
                .map(|signal| signal as i32)
                .with_context(|| format!("Unknown signal {s:?}"))
        })
        .collect()
}
