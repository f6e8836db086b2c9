// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs the crashing test binary in one configuration and collects what it left behind.

use crate::{
    build_artifacts,
    test_types::{CrashType, TestMode},
    ArtifactsBuild, BuildProfile,
};
use anyhow::{Context, Result};
use crashcatch::{receiver, CrashReport};
use std::{
    fs,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process,
};

/// Name of the report file inside the fixture directory.
pub const REPORT_FILE: &str = "crash_report";
/// Written by the prechained handler when it runs.
pub const CHAINED_MARKER_FILE: &str = "chained";
/// Sink of the ignored second install.
pub const SECOND_REPORT_FILE: &str = "second_report";
/// Written by the binary when it survives the signal.
pub const SURVIVED_MARKER_FILE: &str = "survived";

#[derive(Debug, Clone)]
pub struct CrashTestConfig<'a> {
    pub profile: BuildProfile,
    pub mode: TestMode,
    pub crash_type: CrashType,
    /// Additional environment variables to set
    pub env_vars: Vec<(&'a str, &'a str)>,
}

impl<'a> CrashTestConfig<'a> {
    pub fn new(profile: BuildProfile, mode: TestMode, crash_type: CrashType) -> Self {
        Self {
            profile,
            mode,
            crash_type,
            env_vars: vec![],
        }
    }

    pub fn with_env(mut self, key: &'a str, value: &'a str) -> Self {
        self.env_vars.push((key, value));
        self
    }
}

pub struct TestFixtures {
    pub output_dir: PathBuf,
    pub report_path: PathBuf,
    tmpdir: tempfile::TempDir,
}

impl TestFixtures {
    pub fn new() -> Result<Self> {
        let tmpdir = tempfile::TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self {
            output_dir: tmpdir.path().to_path_buf(),
            report_path: tmpdir.path().join(REPORT_FILE),
            tmpdir,
        })
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.tmpdir.path().join(file)
    }
}

/// Everything a finished test process leaves behind.
pub struct CrashTestOutcome {
    pub exit_status: process::ExitStatus,
    /// Raw content of the report sink, empty if nothing was written.
    pub raw_report: String,
    pub stderr: String,
    pub fixtures: TestFixtures,
}

impl CrashTestOutcome {
    /// The signal that terminated the process, if it was killed by one.
    pub fn termination_signal(&self) -> Option<i32> {
        self.exit_status.signal()
    }

    pub fn report(&self) -> Result<CrashReport> {
        receiver::parse_report(&self.raw_report).context("Failed to parse the crash report")
    }

    pub fn fixture_exists(&self, file: &str) -> bool {
        self.fixtures.path(file).exists()
    }
}

pub fn crashcatch_bin(profile: BuildProfile) -> ArtifactsBuild {
    ArtifactsBuild::bin("crashcatch_bin_test", profile)
}

/// Builds the test binary, runs it in `config` and waits for it to die.
pub fn run_crash_test(config: &CrashTestConfig) -> Result<CrashTestOutcome> {
    let bin = crashcatch_bin(config.profile);
    let artifacts = build_artifacts(&[&bin])?;
    let fixtures = TestFixtures::new()?;

    let mut cmd = process::Command::new(&artifacts[&bin]);
    cmd.arg(config.mode.as_str())
        .arg(config.crash_type.as_str())
        .arg(&fixtures.output_dir)
        .env(crashcatch::ENV_OUTPUT, &fixtures.report_path)
        .env("RUST_LOG", "crashcatch=debug")
        .stdout(process::Stdio::null())
        .stderr(process::Stdio::piped());
    for (key, val) in &config.env_vars {
        cmd.env(key, val);
    }

    let child = cmd.spawn().context("Failed to spawn test process")?;
    let output = crate::timeit!("exit after signal", { child.wait_with_output()? });

    Ok(CrashTestOutcome {
        exit_status: output.status,
        raw_report: read_optional(&fixtures.report_path)?,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        fixtures,
    })
}

fn read_optional(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Checks the parts of a report every captured crash must have.
pub fn validate_report(report: &CrashReport, crash_type: CrashType) -> Result<()> {
    anyhow::ensure!(report.complete, "Report is truncated: {report:?}");
    let sig_info = report.sig_info.as_ref().context("Report has no siginfo")?;
    anyhow::ensure!(
        sig_info.si_signo == crash_type.signal(),
        "Expected signal {}, got {}",
        crash_type.signal(),
        sig_info.si_signo
    );
    anyhow::ensure!(
        crashcatch::is_user_sent(sig_info.si_code) != crash_type.is_fault(),
        "Unexpected si_code {} for {crash_type}",
        sig_info.si_code
    );
    let proc_info = report.proc_info.as_ref().context("Report has no procinfo")?;
    anyhow::ensure!(proc_info.pid != 0, "Report has pid 0");
    anyhow::ensure!(proc_info.tid != 0, "Report has tid 0");
    let stacktrace = report.stacktrace.as_ref().context("Report has no stacktrace")?;
    anyhow::ensure!(!stacktrace.frames.is_empty(), "Stacktrace has no frames");
    if let Some(ucontext) = &report.ucontext {
        anyhow::ensure!(
            stacktrace.frames[0].ip == ucontext.ip,
            "First frame {} is not the interrupted ip {}",
            stacktrace.frames[0].ip,
            ucontext.ip
        );
    }
    Ok(())
}
