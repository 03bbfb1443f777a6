//! Stepper and trajectory queue streams.
//!
//! Both carry raw tick counts or controller-time floats that must be mapped
//! onto log time via the owning unit's clock estimate. The estimate is
//! snapshotted at stream creation; an unknown unit degrades to the identity
//! clock so the lines still come through, just unadjusted.

use std::collections::HashMap;

use regex::Regex;

use crate::clock::ClockEstimate;
use crate::streams::{Claim, McuState, TimestampedLine};

/// Stepper motion queue dump stream.
pub struct StepperStream {
    name: String,
    clock_est: ClockEstimate,
    lines: Vec<TimestampedLine>,
    step_re: Regex,
}

impl StepperStream {
    pub fn new(name: &str, mcu_name: &str, mcus: &HashMap<String, McuState>) -> Self {
        let clock_est = mcus
            .get(mcu_name)
            .map(|mcu| mcu.clock_est)
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            clock_est,
            lines: Vec::new(),
            // queue_step 13: t=377500084 p=528 i=1282 c=21 a=0
            step_re: Regex::new(r"^queue_step (?<count>[0-9]+): t=(?<clock>[0-9]+) ").unwrap(),
        }
    }

    pub fn claim(&mut self, line_num: usize, line: &str) -> Claim {
        if let Some(m) = self.step_re.captures(line) {
            let clock: f64 = m["clock"].parse().unwrap_or(0.0);
            let ts = self.clock_est.clock_to_time(clock);

            let mut parts: Vec<String> = line.splitn(5, ' ').map(String::from).collect();
            parts[0] = format!("{} queue_step", self.name);
            if let Some(field) = parts.get_mut(2) {
                field.push_str(&format!("({:.6})", ts));
            }
            self.lines.push(TimestampedLine {
                time: ts,
                line_num,
                text: parts.join(" "),
            });
            return Claim::Consumed;
        }
        Claim::Pass
    }

    pub fn take_lines(&mut self) -> Vec<TimestampedLine> {
        std::mem::take(&mut self.lines)
    }
}

/// Trajectory queue dump stream. Move times are controller-time floats, so
/// they are first scaled to ticks by the primary unit's frequency.
pub struct TrapqStream {
    name: String,
    mcu_freq: f64,
    clock_est: ClockEstimate,
    lines: Vec<TimestampedLine>,
    move_re: Regex,
}

impl TrapqStream {
    pub fn new(name: &str, mcus: &HashMap<String, McuState>) -> Self {
        let (mcu_freq, clock_est) = match mcus.get("mcu") {
            Some(mcu) => (mcu.mcu_freq, mcu.clock_est),
            None => (1.0, ClockEstimate::default()),
        };
        Self {
            name: name.to_string(),
            mcu_freq,
            clock_est,
            lines: Vec::new(),
            // move 17: pt=1525.550959 mt=0.002690 sv=97.357582 a=0.000000 ...
            move_re: Regex::new(r"^move (?<count>[0-9]+): pt=(?<time>[0-9]+\.[0-9]+)").unwrap(),
        }
    }

    pub fn claim(&mut self, line_num: usize, line: &str) -> Claim {
        if let Some(m) = self.move_re.captures(line) {
            let pt: f64 = m["time"].parse().unwrap_or(0.0);
            let ts = self.clock_est.clock_to_time(pt * self.mcu_freq);

            let mut parts: Vec<String> = line.splitn(5, ' ').map(String::from).collect();
            parts[0] = format!("{} move", self.name);
            if let Some(field) = parts.get_mut(2) {
                field.push_str(&format!("({:.6})", ts));
            }
            self.lines.push(TimestampedLine {
                time: ts,
                line_num,
                text: parts.join(" "),
            });
            return Claim::Consumed;
        }
        Claim::Pass
    }

    pub fn take_lines(&mut self) -> Vec<TimestampedLine> {
        std::mem::take(&mut self.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mcus_with_clock() -> HashMap<String, McuState> {
        let mut mcu = McuState::new("mcu");
        mcu.claim(
            "clocksync state: mcu_freq=16000000 last_clock=103731446 \
             clock_est=(100.000 1600000000 16000000.0) min_half_rtt=0.000050",
        );
        let mut mcus = HashMap::new();
        mcus.insert("mcu".to_string(), mcu);
        mcus
    }

    #[test]
    fn test_stepper_rewrite_and_timestamp() {
        let mcus = mcus_with_clock();
        let mut stream = StepperStream::new("stepper_x", "mcu", &mcus);

        let claim = stream.claim(7, "queue_step 13: t=1616000000 p=528 i=1282 c=21 a=0");
        assert!(matches!(claim, Claim::Consumed));

        let lines = stream.take_lines();
        assert_eq!(lines.len(), 1);
        assert!((lines[0].time - 101.0).abs() < 1e-9);
        assert_eq!(
            lines[0].text,
            "stepper_x queue_step 13: t=1616000000(101.000000) p=528 i=1282 c=21 a=0"
        );
    }

    #[test]
    fn test_stepper_unknown_unit_uses_identity_clock() {
        let mcus = HashMap::new();
        let mut stream = StepperStream::new("stepper_y", "mcu2", &mcus);
        stream.claim(3, "queue_step 0: t=250 p=1 i=2 c=3 a=0");
        let lines = stream.take_lines();
        assert_eq!(lines[0].time, 250.0);
    }

    #[test]
    fn test_stepper_ignores_other_lines() {
        let mcus = mcus_with_clock();
        let mut stream = StepperStream::new("stepper_x", "mcu", &mcus);
        assert!(matches!(
            stream.claim(1, "Stats 100.0: gcodein=0"),
            Claim::Pass
        ));
    }

    #[test]
    fn test_trapq_rewrite_and_timestamp() {
        let mcus = mcus_with_clock();
        let mut stream = TrapqStream::new("toolhead", &mcus);

        // pt * mcu_freq = 101.0 * 16 MHz worth of ticks, one second past
        // the sample point of the clock estimate.
        let claim = stream.claim(9, "move 17: pt=101.000000 mt=0.002690 sv=97.357582 a=0.0");
        assert!(matches!(claim, Claim::Consumed));

        let lines = stream.take_lines();
        assert!((lines[0].time - 101.0).abs() < 1e-9);
        assert_eq!(
            lines[0].text,
            "toolhead move 17: pt=101.000000(101.000000) mt=0.002690 sv=97.357582 a=0.0"
        );
    }

    #[test]
    fn test_trapq_without_primary_unit() {
        let mcus = HashMap::new();
        let mut stream = TrapqStream::new("toolhead", &mcus);
        stream.claim(2, "move 1: pt=5.500000 mt=0.1");
        let lines = stream.take_lines();
        assert_eq!(lines[0].time, 5.5);
    }
}
