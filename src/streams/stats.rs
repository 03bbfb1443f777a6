//! Periodic statistics stream and timestamp reconciliation.
//!
//! The stats stream is always listening: `Stats <time>:` lines carry the
//! incident's wall-clock, every other unclaimed line is captured with a
//! placeholder timestamp, and dump-section headers spawn the other streams.
//! At finalization the placeholders are resolved against the units'
//! sequence/time tables so that interleaved context lands between the right
//! neighbors in the merged timeline.

use std::collections::HashMap;

use regex::Regex;

use crate::streams::{
    ApiStream, McuState, SectionStream, StepperStream, TimestampedLine, TrapqStream,
};

/// Upper bound placeholder used while clamping timestamps.
const TS_SENTINEL: f64 = 999_999_999_999.0;
/// Nudge keeping resolved timestamps strictly between their bounds.
const TS_EPSILON: f64 = 0.000_000_01;
/// Leading statistics older than this many seconds before the earliest
/// queue event are dropped from the report.
const STALE_STATS_SECS: f64 = 5.0;

/// What the assembler should do after the stats stream saw a line.
pub enum StatsAction {
    None,
    /// A dump header opened a new section stream.
    Spawn(SectionStream),
    /// The g-code dump header re-activates the resident g-code stream.
    ActivateGcode,
    /// A `gcode state:` snapshot; forward the line to the g-code stream.
    GcodeState,
}

pub struct StatsStream {
    shutdown_line_num: usize,
    first_stat_time: Option<f64>,
    last_stat_time: Option<f64>,
    entries: Vec<(Option<f64>, usize, String)>,
    stats_re: Regex,
    mcu_re: Regex,
    stepper_re: Regex,
    trapq_re: Regex,
    gcode_re: Regex,
    gcode_state_re: Regex,
    api_re: Regex,
}

impl StatsStream {
    pub fn new(shutdown_line_num: usize) -> Self {
        Self {
            shutdown_line_num,
            first_stat_time: None,
            last_stat_time: None,
            entries: Vec::new(),
            // Stats 451.5: gcodein=0 mcu: mcu_awake=0.002 ... print_time=423.011
            stats_re: Regex::new(r"^Stats (?<time>[0-9]+\.[0-9]+): ").unwrap(),
            // MCU 'mcu' shutdown: Timer too close
            mcu_re: Regex::new(r"^MCU '(?<mcu>.+?)' (?:is_)?shutdown: (?<reason>.*)$").unwrap(),
            // Dumping stepper 'stepper_x' (mcu) 128 queue_step:
            stepper_re: Regex::new(
                r"^Dumping stepper '(?<name>[^']*)' \((?<mcu>[^)]+)\) (?<count>[0-9]+) queue_step:$",
            )
            .unwrap(),
            // Dumping trapq 'toolhead' 100 moves:
            trapq_re: Regex::new(r"^Dumping trapq '(?<name>[^']*)' (?<count>[0-9]+) moves:$")
                .unwrap(),
            gcode_re: Regex::new(r"Dumping gcode input (?<count>[0-9]+) blocks$").unwrap(),
            gcode_state_re: Regex::new(r"^gcode state: ").unwrap(),
            api_re: Regex::new(r"Dumping (?<count>[0-9]+) requests for client (?<client>[0-9]+)$")
                .unwrap(),
        }
    }

    /// Discard pre-trigger context from the authoritative start time, so the
    /// replayed ring buffer does not stretch the incident window.
    pub fn reset_first_stat_time(&mut self) {
        self.first_stat_time = self.last_stat_time;
    }

    pub fn stat_times(&self) -> (Option<f64>, Option<f64>) {
        (self.first_stat_time, self.last_stat_time)
    }

    /// Offer a line. Statistics are captured with their own timestamp; any
    /// other line is captured with a placeholder and then checked for a
    /// section header.
    pub fn parse_line(
        &mut self,
        mcus: &mut HashMap<String, McuState>,
        line_num: usize,
        line: &str,
    ) -> StatsAction {
        if let Some(m) = self.stats_re.captures(line) {
            let ts: f64 = m["time"].parse().unwrap_or(0.0);
            self.last_stat_time = Some(ts);
            if self.first_stat_time.is_none() {
                self.first_stat_time = Some(ts);
            }
            self.entries.push((Some(ts), line_num, line.to_string()));
            return StatsAction::None;
        }

        self.entries.push((None, line_num, line.to_string()));

        if let Some(m) = self.mcu_re.captures(line) {
            let name = m["mcu"].to_string();
            mcus.insert(name.clone(), McuState::new(&name));
            return StatsAction::Spawn(SectionStream::Unit(name));
        }
        if let Some(m) = self.stepper_re.captures(line) {
            return StatsAction::Spawn(SectionStream::Stepper(StepperStream::new(
                &m["name"], &m["mcu"], mcus,
            )));
        }
        if let Some(m) = self.trapq_re.captures(line) {
            return StatsAction::Spawn(SectionStream::Trapq(TrapqStream::new(&m["name"], mcus)));
        }
        if self.gcode_re.is_match(line) {
            return StatsAction::ActivateGcode;
        }
        if self.gcode_state_re.is_match(line) {
            return StatsAction::GcodeState;
        }
        if self.api_re.is_match(line) {
            return StatsAction::Spawn(SectionStream::Api(ApiStream::new()));
        }
        StatsAction::None
    }

    /// Clamp a statistics timestamp between the tightest bounds implied by
    /// the send/receive sequence counters it reports for each unit.
    fn check_stats_seq(mcus: &HashMap<String, McuState>, ts: f64, line: &str) -> f64 {
        let mut unit = "";
        let mut keyparts: HashMap<String, &str> = HashMap::new();
        for part in line.split(' ').skip(2) {
            if !part.contains('=') {
                unit = part;
                continue;
            }
            let mut split = part.splitn(3, '=');
            let name = split.next().unwrap_or("");
            let value = split.next().unwrap_or("");
            keyparts.insert(format!("{}{}", unit, name), value);
        }

        let mut min_ts: f64 = 0.0;
        let mut max_ts: f64 = TS_SENTINEL;
        for (name, mcu) in mcus {
            let sname = format!("{}:send_seq", name);
            let rname = format!("{}:receive_seq", name);
            let Some(sseq) = keyparts.get(&sname).and_then(|v| v.parse::<i64>().ok()) else {
                continue;
            };
            let rseq = keyparts.get(&rname).and_then(|v| v.parse::<i64>().ok());

            min_ts = min_ts
                .max(mcu.sent_seq_to_time.get(&(sseq - 1)).copied().unwrap_or(0.0))
                .max(
                    rseq.and_then(|r| mcu.receive_seq_to_time.get(&r))
                        .copied()
                        .unwrap_or(0.0),
                );
            max_ts = max_ts
                .min(mcu.sent_seq_to_time.get(&sseq).copied().unwrap_or(TS_SENTINEL))
                .min(
                    rseq.and_then(|r| mcu.receive_seq_to_time.get(&(r + 1)))
                        .copied()
                        .unwrap_or(TS_SENTINEL),
                );
        }
        ts.max(min_ts + TS_EPSILON).min(max_ts - TS_EPSILON)
    }

    /// Resolve placeholder timestamps and yield the final line sequence.
    /// Without any recorded queue events there is nothing to anchor the
    /// stream to, and it contributes nothing.
    pub fn resolve(&mut self, mcus: &HashMap<String, McuState>) -> Vec<TimestampedLine> {
        let mut all_ts: Vec<f64> = Vec::new();
        for mcu in mcus.values() {
            all_ts.extend(mcu.sent_seq_to_time.values());
            all_ts.extend(mcu.receive_seq_to_time.values());
        }
        if all_ts.is_empty() {
            return Vec::new();
        }
        let min_stream_ts = all_ts.iter().copied().fold(f64::INFINITY, f64::min);
        let max_stream_ts = all_ts.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut entries = std::mem::take(&mut self.entries);

        if let Some(first_relevant) = entries
            .iter()
            .position(|(ts, _, _)| ts.map_or(false, |t| t >= min_stream_ts - STALE_STATS_SECS))
        {
            if first_relevant > 0 {
                entries.drain(..first_relevant);
            }
        }

        let mut last_ts = min_stream_ts;
        if let Some(&(Some(first_stat), _, _)) = entries.iter().find(|entry| entry.0.is_some()) {
            last_ts = first_stat;
        }

        let mut out = Vec::with_capacity(entries.len());
        for (ts, line_num, text) in entries {
            match ts {
                Some(t) => last_ts = Self::check_stats_seq(mcus, t, &text),
                None => {
                    // Context after the trigger belongs past every queue
                    // event exactly once.
                    if line_num >= self.shutdown_line_num && last_ts <= max_stream_ts {
                        last_ts = max_stream_ts + TS_EPSILON;
                    }
                }
            }
            out.push(TimestampedLine {
                time: last_ts,
                line_num,
                text,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::Claim;

    fn anchored_mcus() -> HashMap<String, McuState> {
        let mut mcus = HashMap::new();
        let mut mcu = McuState::new("mcu");
        mcu.claim("Dumping serial stats: bytes_write=1 bytes_read=1 send_seq=600 receive_seq=600 srtt=0.000");
        mcus.insert("mcu".to_string(), mcu);

        let mut sent = crate::streams::SentStream::new("mcu", 100);
        // Record sequences 601 and 602 at 50.0 and 51.0.
        assert!(matches!(
            sent.claim(&mut mcus, 1, "Sent 101 50.000000 50.000000 9: seq: 19, cmd"),
            Claim::Consumed
        ));
        assert!(matches!(
            sent.claim(&mut mcus, 2, "Sent 102 51.000000 51.000000 9: seq: 1a, cmd"),
            Claim::Consumed
        ));
        mcus
    }

    #[test]
    fn test_stats_window_tracking() {
        let mut stream = StatsStream::new(1);
        let mut mcus = HashMap::new();
        stream.parse_line(&mut mcus, 1, "Stats 10.0: gcodein=0");
        stream.parse_line(&mut mcus, 2, "Stats 16.5: gcodein=0");
        assert_eq!(stream.stat_times(), (Some(10.0), Some(16.5)));

        stream.reset_first_stat_time();
        assert_eq!(stream.stat_times(), (Some(16.5), Some(16.5)));
    }

    #[test]
    fn test_section_headers_spawn_streams() {
        let mut stream = StatsStream::new(1);
        let mut mcus = HashMap::new();

        match stream.parse_line(&mut mcus, 1, "MCU 'mcu' shutdown: Timer too close") {
            StatsAction::Spawn(SectionStream::Unit(name)) => assert_eq!(name, "mcu"),
            _ => panic!("expected a unit section"),
        }
        assert!(mcus.contains_key("mcu"));

        match stream.parse_line(&mut mcus, 2, "Dumping stepper 'stepper_x' (mcu) 128 queue_step:") {
            StatsAction::Spawn(SectionStream::Stepper(_)) => {}
            _ => panic!("expected a stepper section"),
        }
        match stream.parse_line(&mut mcus, 3, "Dumping trapq 'toolhead' 100 moves:") {
            StatsAction::Spawn(SectionStream::Trapq(_)) => {}
            _ => panic!("expected a trapq section"),
        }
        assert!(matches!(
            stream.parse_line(&mut mcus, 4, "Dumping gcode input 50 blocks"),
            StatsAction::ActivateGcode
        ));
        assert!(matches!(
            stream.parse_line(&mut mcus, 5, "gcode state: absolute_coord=True"),
            StatsAction::GcodeState
        ));
        assert!(matches!(
            stream.parse_line(&mut mcus, 6, "Dumping 20 requests for client 139870559"),
            StatsAction::Spawn(SectionStream::Api(_))
        ));
    }

    #[test]
    fn test_check_stats_seq_clamps_into_window() {
        let mcus = anchored_mcus();
        // send_seq=602 means sequence 601 was already sent (50.0); the next
        // send at 51.0 bounds the stat from above.
        let clamped = StatsStream::check_stats_seq(
            &mcus,
            49.0,
            "Stats 49.0: gcodein=0 mcu: send_seq=602 receive_seq=600",
        );
        assert!((clamped - 50.0).abs() < 1e-6 && clamped > 50.0);

        let clamped = StatsStream::check_stats_seq(
            &mcus,
            60.0,
            "Stats 60.0: gcodein=0 mcu: send_seq=602 receive_seq=600",
        );
        assert!((clamped - 51.0).abs() < 1e-6 && clamped < 51.0);

        // In-window timestamps pass through untouched.
        let clamped = StatsStream::check_stats_seq(
            &mcus,
            50.5,
            "Stats 50.5: gcodein=0 mcu: send_seq=602 receive_seq=600",
        );
        assert_eq!(clamped, 50.5);
    }

    #[test]
    fn test_resolve_without_queue_events_is_empty() {
        let mut stream = StatsStream::new(1);
        let mut mcus = HashMap::new();
        stream.parse_line(&mut mcus, 1, "Stats 10.0: gcodein=0");
        stream.parse_line(&mut mcus, 2, "some context line");
        assert!(stream.resolve(&mcus).is_empty());
    }

    #[test]
    fn test_resolve_assigns_placeholder_times() {
        let mut mcus = anchored_mcus();
        let mut stream = StatsStream::new(4);
        stream.parse_line(&mut mcus, 3, "Stats 50.200000: gcodein=0 mcu: send_seq=602 receive_seq=600");
        stream.parse_line(&mut mcus, 4, "MCU 'mcu' shutdown: Timer too close");
        stream.parse_line(&mut mcus, 5, "post-trigger context");

        let lines = stream.resolve(&mcus);
        assert_eq!(lines.len(), 3);
        // The stat keeps its (clamped) own time.
        assert_eq!(lines[0].time, 50.2);
        // Post-trigger placeholders jump just past the last queue event.
        assert!(lines[1].time > 51.0);
        assert_eq!(lines[1].time, lines[2].time);
    }

    #[test]
    fn test_resolve_drops_stale_leading_stats() {
        let mut mcus = anchored_mcus();
        let mut stream = StatsStream::new(10);
        // 40.0 is more than five seconds before the earliest queue event.
        stream.parse_line(&mut mcus, 1, "Stats 40.000000: gcodein=0");
        stream.parse_line(&mut mcus, 2, "Stats 48.000000: gcodein=0");
        stream.parse_line(&mut mcus, 3, "Stats 50.500000: gcodein=0");

        let lines = stream.resolve(&mcus);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].text.starts_with("Stats 48."));
    }
}
