// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads a crash report back from the text the crash handler emitted.
//!
//! The report usually shares its stream with other output (the default sink is stderr), so
//! everything before `CRASHCATCH_BEGIN_REPORT` is skipped.  A report without its
//! `CRASHCATCH_DONE` line is still returned, with `complete` set to false: that is what a second
//! fault during capture leaves behind.

use crate::crash_info::{CrashReport, ProcInfo, SigInfo, StackFrame, StackTrace, Ucontext};
use crate::shared::constants::*;
use std::io::BufRead;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReportParseError {
    #[error("No crash report found in the input")]
    NoReport,
    #[error("Invalid {section} payload: {source}")]
    InvalidPayload {
        section: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to read the report: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
enum ReportState {
    /// Before the first line of a report.
    Searching,
    Done,
    File(String, Vec<String>),
    ProcInfo,
    SigInfo,
    StackTrace,
    ThreadName(Option<String>),
    Ucontext,
    Waiting,
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    section: &'static str,
    line: &str,
) -> Result<T, ReportParseError> {
    serde_json::from_str(line).map_err(|source| ReportParseError::InvalidPayload { section, source })
}

/// A state machine that processes the report line by line.  The collector emits data in
/// sections, so `state` remembers which section we are in.
fn process_line(
    report: &mut CrashReport,
    line: &str,
    state: ReportState,
) -> Result<ReportState, ReportParseError> {
    let next = match state {
        ReportState::Searching if line.starts_with(CRASHCATCH_BEGIN_REPORT) => ReportState::Waiting,
        ReportState::Searching => ReportState::Searching,

        ReportState::Done => {
            debug!(line, "Unexpected line after the crash report is done");
            ReportState::Done
        }

        ReportState::File(filename, lines) if line.starts_with(CRASHCATCH_END_FILE) => {
            report.files.insert(filename, lines);
            ReportState::Waiting
        }
        ReportState::File(name, mut contents) => {
            contents.push(line.to_string());
            ReportState::File(name, contents)
        }

        ReportState::ProcInfo if line.starts_with(CRASHCATCH_END_PROCINFO) => ReportState::Waiting,
        ReportState::ProcInfo => {
            let proc_info: ProcInfo = parse_payload("procinfo", line)?;
            report.proc_info = Some(proc_info);
            ReportState::ProcInfo
        }

        ReportState::SigInfo if line.starts_with(CRASHCATCH_END_SIGINFO) => ReportState::Waiting,
        ReportState::SigInfo => {
            let sig_info: SigInfo = parse_payload("siginfo", line)?;
            report.sig_info = Some(sig_info);
            ReportState::SigInfo
        }

        ReportState::StackTrace if line.starts_with(CRASHCATCH_END_STACKTRACE) => {
            if let Some(stacktrace) = report.stacktrace.as_mut() {
                stacktrace.set_complete();
            }
            ReportState::Waiting
        }
        ReportState::StackTrace if line.starts_with(CRASHCATCH_STACKTRACE_TRUNCATED) => {
            report
                .stacktrace
                .get_or_insert_with(StackTrace::new_incomplete)
                .set_truncated();
            ReportState::StackTrace
        }
        ReportState::StackTrace => {
            let frame: StackFrame = parse_payload("stacktrace", line)?;
            report
                .stacktrace
                .get_or_insert_with(StackTrace::new_incomplete)
                .push_frame(frame);
            ReportState::StackTrace
        }

        ReportState::ThreadName(thread_name) if line.starts_with(CRASHCATCH_END_THREAD_NAME) => {
            if thread_name.is_none() {
                debug!("Thread name block ended without content");
            }
            report.thread_name = thread_name;
            ReportState::Waiting
        }
        ReportState::ThreadName(_) => {
            let name = line.trim_end_matches('\n').to_string();
            ReportState::ThreadName(Some(name))
        }

        ReportState::Ucontext if line.starts_with(CRASHCATCH_END_UCONTEXT) => ReportState::Waiting,
        ReportState::Ucontext => {
            let ucontext: Ucontext = parse_payload("ucontext", line)?;
            report.ucontext = Some(ucontext);
            ReportState::Ucontext
        }

        ReportState::Waiting if line.starts_with(CRASHCATCH_BEGIN_FILE) => {
            let (_, filename) = line.split_once(' ').unwrap_or(("", "MISSING_FILENAME"));
            ReportState::File(filename.to_string(), vec![])
        }
        ReportState::Waiting if line.starts_with(CRASHCATCH_BEGIN_PROCINFO) => {
            ReportState::ProcInfo
        }
        ReportState::Waiting if line.starts_with(CRASHCATCH_BEGIN_SIGINFO) => ReportState::SigInfo,
        ReportState::Waiting if line.starts_with(CRASHCATCH_BEGIN_STACKTRACE) => {
            report.stacktrace = Some(StackTrace::new_incomplete());
            ReportState::StackTrace
        }
        ReportState::Waiting if line.starts_with(CRASHCATCH_BEGIN_THREAD_NAME) => {
            ReportState::ThreadName(None)
        }
        ReportState::Waiting if line.starts_with(CRASHCATCH_BEGIN_UCONTEXT) => {
            ReportState::Ucontext
        }
        ReportState::Waiting if line.starts_with(CRASHCATCH_DONE) => {
            report.complete = true;
            ReportState::Done
        }
        ReportState::Waiting => {
            debug!(line, "Unexpected line while receiving crash report");
            ReportState::Waiting
        }
    };
    Ok(next)
}

/// Reads `stream` line by line until it ends, and returns the first crash report found in it, if
/// any.  Invalid UTF-8 is replaced rather than rejected.
pub fn receive_report_from_stream(
    mut stream: impl BufRead,
) -> Result<Option<CrashReport>, ReportParseError> {
    let mut report = CrashReport::default();
    let mut state = ReportState::Searching;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if stream.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        state = process_line(&mut report, line, state)?;
        if matches!(state, ReportState::Done) {
            break;
        }
    }
    match state {
        ReportState::Searching => Ok(None),
        ReportState::Done => Ok(Some(report)),
        other => {
            debug!(state = ?other, "Crash report ended before it was complete");
            Ok(Some(report))
        }
    }
}

/// Parses the crash report contained in `input`.
pub fn parse_report(input: &str) -> Result<CrashReport, ReportParseError> {
    receive_report_from_stream(input.as_bytes())?.ok_or(ReportParseError::NoReport)
}

/// Parses the crash report in the file at `path`.
pub fn parse_report_file(path: impl AsRef<std::path::Path>) -> Result<CrashReport, ReportParseError> {
    let file = std::fs::File::open(path)?;
    receive_report_from_stream(std::io::BufReader::new(file))?.ok_or(ReportParseError::NoReport)
}
