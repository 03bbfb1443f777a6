//! Per-incident shutdown assembly and timeline merge.
//!
//! When an incident trigger is seen, the assembler replays the recent-line
//! context through itself, then routes every following line to its streams:
//! the active dump section first, the resident statistics stream second.
//! Termination merges all captured streams into one chronologically ordered
//! report.

use std::collections::{HashMap, VecDeque};

use regex::Regex;

use crate::artifact::{
    format_comment, OutputFile, CONFIG_SECTION_START, LOG_ROLLOVER_PATTERN,
};
use crate::config_dump::ConfigSet;
use crate::streams::{
    Claim, GCodeStream, McuState, SectionStream, StatsAction, StatsStream, TimestampedLine,
};

/// Index of the resident g-code stream in the stream table.
const GCODE_STREAM: usize = 0;

pub struct ShutdownAssembler {
    filename: String,
    incident_span: f64,
    comments: Vec<String>,
    mcus: HashMap<String, McuState>,
    stats: StatsStream,
    /// Every stream activated during this incident. The g-code stream is
    /// resident at a fixed slot so repeated dump headers re-activate it
    /// instead of duplicating it.
    streams: Vec<SectionStream>,
    active: Option<usize>,
    rollover_re: Regex,
    report: Option<OutputFile>,
    gcode_file: Option<OutputFile>,
}

impl ShutdownAssembler {
    pub fn new(
        configs: &mut ConfigSet,
        line_num: usize,
        recent_lines: &VecDeque<(usize, String)>,
        logname: &str,
        incident_span: f64,
    ) -> Self {
        let mut comments = Vec::new();
        // Cross-reference the config that was live when the incident hit.
        if let Some(config) = configs.latest_mut() {
            if let Some((_, trigger_text)) = recent_lines.back() {
                config.add_comment(format_comment(line_num, trigger_text));
            }
            comments.push(format!("# config {}", config.filename()));
        }

        let mut assembler = Self {
            filename: format!("{}.shutdown{:05}", logname, line_num),
            incident_span,
            comments,
            mcus: HashMap::new(),
            stats: StatsStream::new(line_num),
            streams: vec![SectionStream::GCode(GCodeStream::new(line_num, logname))],
            active: None,
            rollover_re: Regex::new(LOG_ROLLOVER_PATTERN).unwrap(),
            report: None,
            gcode_file: None,
        };

        // Replay the ring buffer so context emitted before the trigger is
        // still captured, then reset the window start so that context does
        // not count against the incident span.
        for (replay_num, replay_line) in recent_lines {
            assembler.route_line(*replay_num, replay_line);
        }
        assembler.stats.reset_first_stat_time();
        assembler
    }

    pub fn add_comment(&mut self, comment: String) {
        self.comments.push(comment);
    }

    /// Feed one line. Returns false once the incident is closed, either by
    /// its statistics window outgrowing the configured span or by a marker
    /// that always starts a new log section.
    pub fn add_line(&mut self, line_num: usize, line: &str) -> bool {
        self.route_line(line_num, line);

        if let (Some(first), Some(last)) = self.stats.stat_times() {
            if last > first + self.incident_span {
                self.finalize();
                return false;
            }
        }

        if line.starts_with("Git version")
            || line.starts_with("Start printer at")
            || line == CONFIG_SECTION_START
            || self.rollover_re.is_match(line)
        {
            self.finalize();
            return false;
        }
        true
    }

    fn route_line(&mut self, line_num: usize, line: &str) {
        if let Some(idx) = self.active {
            let claim = self.streams[idx].claim(&mut self.mcus, line_num, line);
            match claim {
                Claim::Consumed => return,
                Claim::Spawn(stream) => {
                    tracing::debug!("activating {} stream", stream.kind().as_ref());
                    self.streams.push(stream);
                    self.active = Some(self.streams.len() - 1);
                    return;
                }
                Claim::Pass => {}
            }
        }

        match self.stats.parse_line(&mut self.mcus, line_num, line) {
            StatsAction::Spawn(stream) => {
                tracing::debug!("activating {} stream", stream.kind().as_ref());
                self.streams.push(stream);
                self.active = Some(self.streams.len() - 1);
            }
            StatsAction::ActivateGcode => {
                self.active = Some(GCODE_STREAM);
            }
            StatsAction::GcodeState => {
                if let SectionStream::GCode(gcode) = &mut self.streams[GCODE_STREAM] {
                    gcode.handle_state(line);
                }
            }
            StatsAction::None => {}
        }
    }

    /// Merge every stream into the final report. Each stream's sequence is
    /// first forced non-decreasing (a subsystem's own clock never moves
    /// backwards), then all sequences are sorted together by timestamp.
    pub fn finalize(&mut self) {
        if let SectionStream::GCode(gcode) = &self.streams[GCODE_STREAM] {
            self.gcode_file = gcode.build_artifact();
        }

        let mut sequences = vec![self.stats.resolve(&self.mcus)];
        for stream in &mut self.streams {
            sequences.push(stream.take_lines());
        }
        for sequence in &mut sequences {
            for i in 1..sequence.len() {
                if sequence[i - 1].time > sequence[i].time {
                    sequence[i].time = sequence[i - 1].time;
                }
            }
        }

        let mut merged: Vec<TimestampedLine> = sequences.into_iter().flatten().collect();
        merged.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));

        let mut content = String::new();
        for comment in &self.comments {
            content.push_str(comment);
            content.push('\n');
        }
        for line in &merged {
            content.push_str(&line.text);
            content.push('\n');
        }
        self.report = Some(OutputFile {
            filename: self.filename.clone(),
            content,
        });
    }

    /// The finalized incident report and recovered g-code script, if any.
    pub fn into_artifacts(self) -> (Option<OutputFile>, Option<OutputFile>) {
        (self.report, self.gcode_file)
    }
}
