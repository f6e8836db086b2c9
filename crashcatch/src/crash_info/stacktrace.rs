// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
    /// True if the collector stopped before it closed the stacktrace section.
    pub incomplete: bool,
    /// True if the walk hit the frame limit, so outer frames are missing.
    #[serde(default)]
    pub truncated: bool,
}

impl StackTrace {
    pub fn new_incomplete() -> Self {
        Self {
            frames: vec![],
            incomplete: true,
            truncated: false,
        }
    }

    pub fn push_frame(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    pub fn set_complete(&mut self) {
        self.incomplete = false;
    }

    pub fn set_truncated(&mut self) {
        self.truncated = true;
    }
}

/// A single frame, addresses only.  Symbol names are a concern of downstream tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp: Option<String>,
}

impl StackFrame {
    /// Parses the instruction pointer back into a number.
    pub fn ip_value(&self) -> Option<u64> {
        parse_hex(&self.ip)
    }
}

pub(crate) fn parse_hex(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}
