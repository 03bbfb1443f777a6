//! Subsystem stream parsers.
//!
//! Each stream recognizes one line grammar from a shutdown dump and claims
//! matching lines into its own timestamped sequence. Streams are consulted
//! in a fixed priority order: the active section stream first, the resident
//! statistics stream second.

pub mod api;
pub mod gcode;
pub mod mcu;
pub mod motion;
pub mod stats;

pub use api::ApiStream;
pub use gcode::GCodeStream;
pub use mcu::{McuState, ReceiveStream, SentStream};
pub use motion::{StepperStream, TrapqStream};
pub use stats::{StatsAction, StatsStream};

use std::collections::HashMap;

use strum::AsRefStr;

/// One captured log line, keyed for the final timeline merge.
#[derive(Clone, Debug)]
pub struct TimestampedLine {
    pub time: f64,
    pub line_num: usize,
    pub text: String,
}

/// Outcome of offering a line to a section stream.
pub enum Claim {
    /// The stream recognized and captured the line.
    Consumed,
    /// The line opens a new subsystem section.
    Spawn(SectionStream),
    /// Not this stream's grammar.
    Pass,
}

/// Stream kinds, named for logging.
#[derive(AsRefStr, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Unit,
    Sent,
    Receive,
    Stepper,
    Trapq,
    GCode,
    Api,
}

/// A dump-section stream. The send and receive queue variants fall back to
/// their owning unit's section matcher when a line is not theirs, so a new
/// dump header inside a unit section opens the next stream directly.
pub enum SectionStream {
    /// A named controller unit's own diagnostic section.
    Unit(String),
    Sent(SentStream),
    Receive(ReceiveStream),
    Stepper(StepperStream),
    Trapq(TrapqStream),
    GCode(GCodeStream),
    Api(ApiStream),
}

impl SectionStream {
    pub fn kind(&self) -> StreamKind {
        match self {
            SectionStream::Unit(_) => StreamKind::Unit,
            SectionStream::Sent(_) => StreamKind::Sent,
            SectionStream::Receive(_) => StreamKind::Receive,
            SectionStream::Stepper(_) => StreamKind::Stepper,
            SectionStream::Trapq(_) => StreamKind::Trapq,
            SectionStream::GCode(_) => StreamKind::GCode,
            SectionStream::Api(_) => StreamKind::Api,
        }
    }

    /// Offer a line to this stream.
    pub fn claim(
        &mut self,
        mcus: &mut HashMap<String, McuState>,
        line_num: usize,
        line: &str,
    ) -> Claim {
        match self {
            SectionStream::Unit(name) => match mcus.get_mut(name.as_str()) {
                Some(mcu) => mcu.claim(line),
                None => Claim::Pass,
            },
            SectionStream::Sent(s) => s.claim(mcus, line_num, line),
            SectionStream::Receive(s) => s.claim(mcus, line_num, line),
            SectionStream::Stepper(s) => s.claim(line_num, line),
            SectionStream::Trapq(s) => s.claim(line_num, line),
            SectionStream::GCode(s) => s.claim(line_num, line),
            SectionStream::Api(s) => s.claim(line_num, line),
        }
    }

    /// Drain captured lines for the final merge. Unit sections own no lines
    /// of their own; everything they match is state, not output.
    pub fn take_lines(&mut self) -> Vec<TimestampedLine> {
        match self {
            SectionStream::Unit(_) => Vec::new(),
            SectionStream::Sent(s) => s.take_lines(),
            SectionStream::Receive(s) => s.take_lines(),
            SectionStream::Stepper(s) => s.take_lines(),
            SectionStream::Trapq(s) => s.take_lines(),
            SectionStream::GCode(s) => s.take_lines(),
            SectionStream::Api(s) => s.take_lines(),
        }
    }
}
