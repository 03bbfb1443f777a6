//! Command/API request queue stream.

use regex::Regex;

use crate::streams::{Claim, TimestampedLine};

/// Captures replayed client requests, which already carry their own
/// timestamps and need no rewriting.
pub struct ApiStream {
    lines: Vec<TimestampedLine>,
    request_re: Regex,
}

impl ApiStream {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            // Received 451.320788: {'id': 1234, 'method': 'objects/query'}
            request_re: Regex::new(r"^Received (?<time>[0-9]+\.[0-9]+): \{.*\}$").unwrap(),
        }
    }

    pub fn claim(&mut self, line_num: usize, line: &str) -> Claim {
        if let Some(m) = self.request_re.captures(line) {
            let ts: f64 = m["time"].parse().unwrap_or(0.0);
            self.lines.push(TimestampedLine {
                time: ts,
                line_num,
                text: line.to_string(),
            });
            return Claim::Consumed;
        }
        Claim::Pass
    }

    pub fn take_lines(&mut self) -> Vec<TimestampedLine> {
        std::mem::take(&mut self.lines)
    }
}

impl Default for ApiStream {
    fn default() -> Self {
        Self::new()
    }
}
