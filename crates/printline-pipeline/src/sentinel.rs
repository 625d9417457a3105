// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Line-sentinel framing for cross-host handoff.
//
// A stage running on another host reports its result by printing exactly one
// line `KEY=value` for the key the caller waits on, then exiting 0.  Every
// other line is noise to be echoed.  The scanner below is fed lines as they
// arrive and judged once the process has exited:
//
//   exit != 0                    -> transport failure, sentinel or not
//   exit == 0, no sentinel       -> protocol violation
//   exit == 0, sentinel twice    -> protocol violation
//   exit == 0, sentinel once     -> handoff value

use std::collections::BTreeMap;

use printline_core::error::{PrintlineError, Result};

/// Key of the result artifact line.
pub const RESULT_PATH: &str = "RESULT_PATH";

/// Key of the optional project-label line.
pub const PROJECT: &str = "PROJECT";

/// Split a `KEY=value` line.  Keys are upper-case ASCII, digits and `_`.
pub fn split_sentinel(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (key, value) = line.split_once('=')?;
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
    valid.then_some((key, value))
}

/// Render a sentinel line (no trailing newline).
pub fn sentinel_line(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// What a successful handoff carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    /// Value of the required key.
    pub value: String,
    /// Values of any optional keys that were seen.
    pub extras: BTreeMap<String, String>,
}

impl Handoff {
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }
}

/// Incremental scanner for one remote process's output.
#[derive(Debug)]
pub struct SentinelScanner {
    required: &'static str,
    optional: Vec<&'static str>,
    seen: BTreeMap<&'static str, String>,
    violation: Option<String>,
}

impl SentinelScanner {
    pub fn new(required: &'static str) -> Self {
        Self {
            required,
            optional: Vec::new(),
            seen: BTreeMap::new(),
            violation: None,
        }
    }

    /// Also capture `key` if it appears; its absence is not an error.
    pub fn with_optional(mut self, key: &'static str) -> Self {
        self.optional.push(key);
        self
    }

    /// Feed one line.  Returns `true` when the line was a tracked sentinel.
    pub fn observe(&mut self, line: &str) -> bool {
        let Some((key, value)) = split_sentinel(line) else {
            return false;
        };
        let Some(tracked) = std::iter::once(self.required)
            .chain(self.optional.iter().copied())
            .find(|k| *k == key)
        else {
            return false;
        };

        if self.seen.insert(tracked, value.to_owned()).is_some() && self.violation.is_none() {
            self.violation = Some(format!("{tracked} reported more than once"));
        }
        true
    }

    /// Whether the required key has been seen so far.
    pub fn has_result(&self) -> bool {
        self.seen.contains_key(self.required)
    }

    /// Judge the stream once the process has exited with `exit_code`.
    pub fn finish(mut self, exit_code: i32) -> Result<Handoff> {
        if exit_code != 0 {
            return Err(PrintlineError::Transport(format!(
                "remote process exited with code {exit_code}"
            )));
        }
        if let Some(violation) = self.violation {
            return Err(PrintlineError::Protocol(violation));
        }
        let value = self.seen.remove(self.required).ok_or_else(|| {
            PrintlineError::Protocol(format!(
                "stage completed but produced no result ({} missing)",
                self.required
            ))
        })?;
        if value.trim().is_empty() {
            return Err(PrintlineError::Protocol(format!("{} is empty", self.required)));
        }
        Ok(Handoff {
            value,
            extras: self
                .seen
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
        })
    }
}
