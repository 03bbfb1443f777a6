//! Controller unit state and send/receive queue streams.
//!
//! Each named unit ("mcu", "extruder mcu", ...) keeps its own clock estimate
//! and sequence tables. Queue dump lines carry truncated sequence numbers
//! and raw tick counts; both are reconstructed to full width and appended to
//! the line in parentheses, and embedded UART byte strings are decoded
//! inline.

use std::collections::HashMap;

use regex::Regex;

use crate::clock::{add_high_bits, ClockEstimate};
use crate::streams::{Claim, SectionStream, TimestampedLine};
use crate::tmc_uart::TmcUartCodec;

/// Per-unit clock and sequence state. Created when the unit's shutdown
/// declaration is seen; lives for the rest of the incident and is consulted
/// by the statistics stream during final timestamp reconciliation.
pub struct McuState {
    name: String,
    pub mcu_freq: f64,
    pub clock_est: ClockEstimate,
    /// Receive sequence reported by the serial stats dump; anchors the
    /// reconstruction of the send queue's truncated sequence numbers.
    shutdown_seq: i64,
    /// (estimated send time, low sequence bits) -> full sequence.
    sent_time_to_seq: HashMap<(u64, i64), i64>,
    pub sent_seq_to_time: HashMap<i64, f64>,
    pub receive_seq_to_time: HashMap<i64, f64>,
    clock_re: Regex,
    serial_stats_re: Regex,
    send_queue_re: Regex,
    receive_queue_re: Regex,
    seq_note_re: Regex,
    clock_note_re: Regex,
    uart_note_re: Regex,
}

impl McuState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mcu_freq: 1.0,
            clock_est: ClockEstimate::default(),
            shutdown_seq: 0,
            sent_time_to_seq: HashMap::new(),
            sent_seq_to_time: HashMap::new(),
            receive_seq_to_time: HashMap::new(),
            // clocksync state: mcu_freq=180000000 ... clock_est=(1527.078 295877137475 180000591.768) ...
            clock_re: Regex::new(
                r"^clocksync state: mcu_freq=(?<freq>[0-9]+) .* clock_est=\((?<st>[^ ]+) (?<sc>[0-9]+) (?<f>[^ ]+)\)",
            )
            .unwrap(),
            // Dumping serial stats: bytes_write=2095116 ... send_seq=51803 receive_seq=51803 ...
            serial_stats_re: Regex::new(
                r"^Dumping serial stats: .* send_seq=(?<sseq>[0-9]+) receive_seq=(?<rseq>[0-9]+) ",
            )
            .unwrap(),
            // Dumping send queue 100 messages
            send_queue_re: Regex::new(r"^Dumping send queue (?<count>[0-9]+) messages$").unwrap(),
            // Dumping receive queue 100 messages
            receive_queue_re: Regex::new(r"^Dumping receive queue (?<count>[0-9]+) messages$")
                .unwrap(),
            seq_note_re: Regex::new(r": seq: 1(?<shortseq>[0-9a-f])").unwrap(),
            clock_note_re: Regex::new(r"clock=(?<clock>[0-9]+)").unwrap(),
            // tmcuart_send oid=3 write=b'\x05\x00\x06\x6f'
            uart_note_re: Regex::new(
                r#"tmcuart_(?:response|send) oid=[0-9]+ (?:read|write)=b?(?<msg>(?:'[^']*'|"[^"]*"))"#,
            )
            .unwrap(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Section matcher for lines inside this unit's shutdown dump. Clock and
    /// serial-stats lines update state but are not captured, so they still
    /// land in the statistics stream as plain context.
    pub fn claim(&mut self, line: &str) -> Claim {
        if let Some(m) = self.clock_re.captures(line) {
            self.mcu_freq = m["freq"].parse().unwrap_or(1.0);
            self.clock_est = ClockEstimate {
                sample_time: m["st"].parse().unwrap_or(0.0),
                sample_clock: m["sc"].parse().unwrap_or(0),
                freq: m["f"].parse().unwrap_or(1.0),
            };
        }
        if let Some(m) = self.serial_stats_re.captures(line) {
            if let Ok(rseq) = m["rseq"].parse() {
                self.shutdown_seq = rseq;
            }
        }
        if let Some(m) = self.send_queue_re.captures(line) {
            let count = m["count"].parse().unwrap_or(0);
            return Claim::Spawn(SectionStream::Sent(SentStream::new(&self.name, count)));
        }
        if self.receive_queue_re.is_match(line) {
            return Claim::Spawn(SectionStream::Receive(ReceiveStream::new(&self.name)));
        }
        Claim::Pass
    }

    /// Map a truncated 32-bit tick to log time via the current estimate.
    fn trans_clock(&self, clock: i64, ts: f64) -> f64 {
        let est = &self.clock_est;
        let expected = (est.sample_clock as f64 + (ts - est.sample_time) * est.freq) as i64;
        let extended = add_high_bits(clock, expected, 0xffff_ffff);
        est.clock_to_time(extended as f64)
    }

    /// Rewrite a claimed line in place: append the reconstructed sequence
    /// after its truncated form, the reconstructed time after a raw tick,
    /// and the decoded UART payload after an escaped byte string. Lines from
    /// units other than the primary one are prefixed with the unit name.
    pub fn annotate(&self, line: &str, seq: Option<i64>, ts: f64) -> String {
        let mut line = line.to_string();
        if let Some(seq) = seq {
            if let Some(m) = self.seq_note_re.find(&line) {
                line.insert_str(m.end(), &format!("({})", seq));
            }
        }
        if let Some(m) = self.clock_note_re.captures(&line) {
            if let Ok(clock) = m["clock"].parse::<i64>() {
                let note = format!("({:.6})", self.trans_clock(clock, ts));
                let end = m.get(0).unwrap().end();
                line.insert_str(end, &note);
            }
        }
        if let Some(m) = self.uart_note_re.captures(&line) {
            let quoted = m.name("msg").unwrap().as_str();
            let bytes = unescape_bytes(quoted[1..quoted.len() - 1].trim());
            let note = TmcUartCodec::parse_msg(&bytes);
            let end = m.get(0).unwrap().end();
            line.insert_str(end, &note);
        }
        if self.name != "mcu" {
            line = format!("mcu '{}': {}", self.name, line);
        }
        line
    }
}

/// Decode the escaped byte-string notation used for UART payloads in the
/// log (`\xHH` hex escapes, `\n`, backslash followed by a literal char).
fn unescape_bytes(s: &str) -> Vec<u8> {
    let chars: Vec<char> = s.chars().collect();
    let mut bytes = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() {
            match chars[i + 1] {
                'x' if i + 3 < chars.len()
                    && chars[i + 2].is_ascii_hexdigit()
                    && chars[i + 3].is_ascii_hexdigit() =>
                {
                    let hex: String = chars[i + 2..=i + 3].iter().collect();
                    bytes.push(u8::from_str_radix(&hex, 16).unwrap());
                    i += 4;
                }
                'n' => {
                    bytes.push(b'\n');
                    i += 2;
                }
                c => {
                    bytes.push((c as u32 & 0xff) as u8);
                    i += 2;
                }
            }
        } else {
            bytes.push((chars[i] as u32 & 0xff) as u8);
            i += 1;
        }
    }
    bytes
}

/// Send queue dump stream: reconstructs full sequence numbers from their
/// low four bits and records send times for later receive-side lookup.
pub struct SentStream {
    mcu: String,
    send_count: i64,
    lines: Vec<TimestampedLine>,
    sent_re: Regex,
}

impl SentStream {
    pub fn new(mcu: &str, send_count: i64) -> Self {
        Self {
            mcu: mcu.to_string(),
            send_count,
            lines: Vec::new(),
            // Sent 60 1527.069903 1527.069903 15: seq: 1b, st_clock clock=334214283520 count=100 add=0
            sent_re: Regex::new(
                r"^Sent (?<count>[0-9]+) (?<esttime>[0-9]+\.[0-9]+) (?<time>[0-9]+\.[0-9]+) [0-9]+: seq: 1(?<shortseq>[0-9a-f]),",
            )
            .unwrap(),
        }
    }

    pub fn claim(
        &mut self,
        mcus: &mut HashMap<String, McuState>,
        line_num: usize,
        line: &str,
    ) -> Claim {
        let Some(mcu) = mcus.get_mut(&self.mcu) else {
            return Claim::Pass;
        };
        if let Some(m) = self.sent_re.captures(line) {
            let shortseq = i64::from_str_radix(&m["shortseq"], 16).unwrap_or(0);
            let count: i64 = m["count"].parse().unwrap_or(0);
            let ts: f64 = m["time"].parse().unwrap_or(0.0);
            let esttime: f64 = m["esttime"].parse().unwrap_or(0.0);

            // Queue position relative to the shutdown sequence gives an
            // approximate full sequence; the short bits pin the exact one.
            let reference = mcu.shutdown_seq + count - self.send_count;
            let seq = add_high_bits(shortseq, reference, 0xf);

            mcu.sent_time_to_seq.insert((esttime.to_bits(), seq & 0xf), seq);
            mcu.sent_seq_to_time.insert(seq, ts);

            let text = mcu.annotate(line, Some(seq), ts);
            self.lines.push(TimestampedLine { time: ts, line_num, text });
            return Claim::Consumed;
        }
        mcu.claim(line)
    }

    pub fn take_lines(&mut self) -> Vec<TimestampedLine> {
        std::mem::take(&mut self.lines)
    }
}

/// Receive queue dump stream: matches receive events back to the recorded
/// send times and confirms receive times for the following sequence.
pub struct ReceiveStream {
    mcu: String,
    lines: Vec<TimestampedLine>,
    receive_re: Regex,
}

impl ReceiveStream {
    pub fn new(mcu: &str) -> Self {
        Self {
            mcu: mcu.to_string(),
            lines: Vec::new(),
            // Receive: 65 1527.078547 1527.078211 17: seq: 1c, uptime high=77 clock=4103941458
            receive_re: Regex::new(
                r"^Receive: (?<count>[0-9]+) (?<time>[0-9]+\.[0-9]+) (?<esttime>[0-9]+\.[0-9]+) [0-9]+: seq: 1(?<shortseq>[0-9a-f]),",
            )
            .unwrap(),
        }
    }

    pub fn claim(
        &mut self,
        mcus: &mut HashMap<String, McuState>,
        line_num: usize,
        line: &str,
    ) -> Claim {
        let Some(mcu) = mcus.get_mut(&self.mcu) else {
            return Claim::Pass;
        };
        if let Some(m) = self.receive_re.captures(line) {
            let shortseq = i64::from_str_radix(&m["shortseq"], 16).unwrap_or(0);
            let ts: f64 = m["time"].parse().unwrap_or(0.0);
            let esttime: f64 = m["esttime"].parse().unwrap_or(0.0);

            let seq = mcu
                .sent_time_to_seq
                .get(&(esttime.to_bits(), (shortseq - 1) & 0xf))
                .copied();
            if let Some(seq) = seq {
                mcu.receive_seq_to_time.insert(seq + 1, ts);
            }

            let text = mcu.annotate(line, seq, ts);
            self.lines.push(TimestampedLine { time: ts, line_num, text });
            return Claim::Consumed;
        }
        mcu.claim(line)
    }

    pub fn take_lines(&mut self) -> Vec<TimestampedLine> {
        std::mem::take(&mut self.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with_clock() -> McuState {
        let mut mcu = McuState::new("mcu");
        let claim = mcu.claim(
            "clocksync state: mcu_freq=16000000 last_clock=103731446 \
             clock_est=(100.000 1600000000 16000000.0) min_half_rtt=0.000050",
        );
        assert!(matches!(claim, Claim::Pass));
        mcu
    }

    #[test]
    fn test_clock_estimate_capture() {
        let mcu = unit_with_clock();
        assert_eq!(mcu.mcu_freq, 16_000_000.0);
        assert_eq!(mcu.clock_est.sample_time, 100.0);
        assert_eq!(mcu.clock_est.sample_clock, 1_600_000_000);
    }

    #[test]
    fn test_serial_stats_sets_shutdown_seq() {
        let mut mcu = McuState::new("mcu");
        let claim = mcu.claim(
            "Dumping serial stats: bytes_write=2095116 bytes_read=3466254 \
             send_seq=600 receive_seq=600 retransmit_seq=2 srtt=0.000",
        );
        assert!(matches!(claim, Claim::Pass));
        assert_eq!(mcu.shutdown_seq, 600);
    }

    #[test]
    fn test_send_queue_spawns_sent_stream() {
        let mut mcu = McuState::new("mcu");
        match mcu.claim("Dumping send queue 100 messages") {
            Claim::Spawn(SectionStream::Sent(_)) => {}
            _ => panic!("expected a sent stream"),
        }
        match mcu.claim("Dumping receive queue 100 messages") {
            Claim::Spawn(SectionStream::Receive(_)) => {}
            _ => panic!("expected a receive stream"),
        }
    }

    #[test]
    fn test_sent_sequence_reconstruction() {
        let mut mcus = HashMap::new();
        let mut mcu = McuState::new("mcu");
        mcu.claim("Dumping serial stats: bytes_write=1 bytes_read=1 send_seq=600 receive_seq=600 srtt=0.000");
        mcus.insert("mcu".to_string(), mcu);

        let mut sent = SentStream::new("mcu", 100);
        let claim = sent.claim(
            &mut mcus,
            10,
            "Sent 98 451.604484 451.604484 9: seq: 1a, get_status",
        );
        assert!(matches!(claim, Claim::Consumed));

        // reference 600 + 98 - 100 = 598; nearest value with low bits 0xa is 602
        let mcu = &mcus["mcu"];
        assert_eq!(mcu.sent_seq_to_time.get(&602), Some(&451.604484));
        assert!(sent.lines[0].text.contains(": seq: 1a(602),"));
    }

    #[test]
    fn test_receive_confirms_next_sequence() {
        let mut mcus = HashMap::new();
        let mut mcu = McuState::new("mcu");
        mcu.claim("Dumping serial stats: bytes_write=1 bytes_read=1 send_seq=600 receive_seq=600 srtt=0.000");
        mcus.insert("mcu".to_string(), mcu);

        let mut sent = SentStream::new("mcu", 100);
        sent.claim(
            &mut mcus,
            10,
            "Sent 98 451.604484 451.604484 9: seq: 1a, get_status",
        );

        // The receive carries the next short sequence; the lookup key is the
        // send event one sequence back at the same estimated time.
        let mut receive = ReceiveStream::new("mcu");
        let claim = receive.claim(
            &mut mcus,
            11,
            "Receive: 99 451.605210 451.604484 17: seq: 1b, status ok",
        );
        assert!(matches!(claim, Claim::Consumed));
        assert_eq!(mcus["mcu"].receive_seq_to_time.get(&603), Some(&451.605210));
        assert!(receive.lines[0].text.contains(": seq: 1b(602),"));
    }

    #[test]
    fn test_annotate_clock_rewrite() {
        let mcu = unit_with_clock();
        // Tick 1616000000 is one second past the estimate's sample point.
        let text = mcu.annotate("stepper stop clock=1616000000", None, 100.9);
        assert_eq!(text, "stepper stop clock=1616000000(101.000000)");
    }

    #[test]
    fn test_annotate_uart_payload() {
        let mcu = unit_with_clock();
        let frame = TmcUartCodec::encode_read(0xf5, 0x00, 0x06);
        let escaped: String = frame.iter().map(|b| format!("\\x{:02x}", b)).collect();
        let line = format!("tmcuart_send oid=3 write=b'{}'", escaped);
        let text = mcu.annotate(&line, None, 0.0);
        assert!(text.ends_with("(6@0)"), "got {}", text);
    }

    #[test]
    fn test_annotate_prefixes_secondary_units() {
        let mcu = McuState::new("extruder");
        let text = mcu.annotate("got shutdown", None, 0.0);
        assert_eq!(text, "mcu 'extruder': got shutdown");
    }

    #[test]
    fn test_unescape_bytes() {
        assert_eq!(unescape_bytes(r"\x05\x00\x06"), vec![0x05, 0x00, 0x06]);
        assert_eq!(unescape_bytes(r"a\nb"), vec![b'a', b'\n', b'b']);
        assert_eq!(unescape_bytes(r"\\"), vec![b'\\']);
        assert_eq!(unescape_bytes("/"), vec![b'/']);
    }
}
