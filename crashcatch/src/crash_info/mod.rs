// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The data model of a crash report, as reconstructed from the emitted stream.

mod sig_info;
mod stacktrace;

pub use sig_info::*;
pub use stacktrace::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcInfo {
    pub pid: u32,
    /// Kernel thread id of the crashing thread.
    pub tid: u64,
}

/// Register values of the interrupted frame, as hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ucontext {
    pub ip: String,
    pub sp: String,
    pub fp: String,
}

/// Everything a crash report carries.
///
/// Fields are optional because a report can be cut short: a second fault during capture stops
/// the emission, and the consumer gets whatever made it out.  `complete` tells the two cases
/// apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub complete: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_info: Option<ProcInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_info: Option<SigInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<StackTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ucontext: Option<Ucontext>,
}

impl CrashReport {
    pub fn signum(&self) -> Option<i32> {
        self.sig_info.as_ref().map(|s| s.si_signo)
    }

    pub fn tid(&self) -> Option<u64> {
        self.proc_info.as_ref().map(|p| p.tid)
    }
}
