//! Replayed g-code command capture and state restore.
//!
//! Inside an incident the firmware echoes the commands it had buffered as
//! `Read <time>: '<command>'` lines. This stream collects them verbatim and,
//! when the interpreter's `gcode state:` snapshot appears, synthesizes a
//! restore preamble (homing, coordinate modes, position, factor overrides)
//! so the recovered script can resume a print from where it stopped.

use std::collections::HashMap;

use regex::Regex;

use crate::artifact::OutputFile;
use crate::streams::{Claim, TimestampedLine};

/// A parsed g-code state parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Num(f64),
    List(Vec<f64>),
    Str(String),
}

impl ParamValue {
    fn truthy(&self) -> bool {
        match self {
            ParamValue::Null => false,
            ParamValue::Bool(b) => *b,
            ParamValue::Num(n) => *n != 0.0 && !n.is_nan(),
            ParamValue::List(_) => true,
            ParamValue::Str(s) => !s.is_empty(),
        }
    }
}

fn truthy(value: Option<&ParamValue>) -> bool {
    value.map_or(false, ParamValue::truthy)
}

/// Numeric coercion with a fallback for absent, zero, or non-numeric values.
fn or_num(value: Option<&ParamValue>, default: f64) -> f64 {
    match value {
        Some(ParamValue::Num(n)) if *n != 0.0 && !n.is_nan() => *n,
        _ => default,
    }
}

/// A position parameter as a 4-vector: absent or empty values default to
/// zeros, but a present value of the wrong shape disables position restore.
fn position_vec(kv: &HashMap<String, ParamValue>, key: &str) -> Option<Vec<f64>> {
    match kv.get(key) {
        None => Some(vec![0.0; 4]),
        Some(v) if !v.truthy() => Some(vec![0.0; 4]),
        Some(ParamValue::List(items)) if items.len() == 4 => Some(items.clone()),
        Some(_) => None,
    }
}

/// G-code queue dump stream.
pub struct GCodeStream {
    filename: String,
    lines: Vec<TimestampedLine>,
    commands: Vec<String>,
    state_preamble: String,
    cmd_re: Regex,
    param_re: Regex,
}

impl GCodeStream {
    pub fn new(shutdown_line_num: usize, logname: &str) -> Self {
        Self {
            filename: format!("{}.gcode{:05}", logname, shutdown_line_num),
            lines: Vec::new(),
            commands: Vec::new(),
            state_preamble: String::new(),
            // Read 451.602146: 'G1 X110.086 Y117.684 E0.01648\n'
            cmd_re: Regex::new(r#"^Read (?<time>[0-9.]+): (?<gcode>["'].*)$"#).unwrap(),
            param_re: Regex::new(r"(?<key>\w+)=(?<value>\[.*?\]|\S+)").unwrap(),
        }
    }

    pub fn claim(&mut self, line_num: usize, line: &str) -> Claim {
        if let Some(m) = self.cmd_re.captures(line) {
            let ts: f64 = m["time"].parse().unwrap_or(0.0);
            self.lines.push(TimestampedLine {
                time: ts,
                line_num,
                text: line.to_string(),
            });
            // Strip the quote pair and the textual newline escapes from the
            // echoed command.
            let quoted = &m["gcode"];
            let inner = strip_quote_pair(quoted);
            self.commands.push(inner.replace("\\n", ""));
            return Claim::Consumed;
        }
        Claim::Pass
    }

    /// Parse the flat `key=value` list of a `gcode state:` line.
    fn extract_params(&self, line: &str) -> HashMap<String, ParamValue> {
        let mut result = HashMap::new();
        for caps in self.param_re.captures_iter(line) {
            result.insert(caps["key"].to_string(), parse_param_value(&caps["value"]));
        }
        result
    }

    /// Build the state-restore preamble emitted at the head of the recovered
    /// script.
    pub fn handle_state(&mut self, line: &str) {
        let kv = self.extract_params(line);
        let mut out: Vec<String> = vec!["; Start g-code state restore".to_string(), "G28".to_string()];

        if !truthy(kv.get("absolute_coord")) && !truthy(kv.get("absolutecoord")) {
            out.push("G91".to_string());
        }
        if !truthy(kv.get("absolute_extrude")) && !truthy(kv.get("absoluteextrude")) {
            out.push("M83".to_string());
        }

        let last = position_vec(&kv, "last_position");
        let base = position_vec(&kv, "base_position");
        let homing = position_vec(&kv, "homing_position");
        if let (Some(lp), Some(bp), Some(hp)) = (last, base, homing) {
            let speed = or_num(kv.get("speed"), 0.0);
            out.push(format!("G1 X{} Y{} Z{} F{}", lp[0], lp[1], lp[2], speed * 60.0));
            if bp[0] != 0.0 || bp[1] != 0.0 || bp[2] != 0.0 {
                out.push("; Must manually set base position...".to_string());
            }
            out.push(format!("G92 E{}", lp[3] - bp[3]));
            if hp.iter().any(|&v| v != 0.0) {
                out.push("; Must manually set homing position...".to_string());
            }
            let speed_factor = or_num(kv.get("speed_factor"), 0.0);
            if (speed_factor - 1.0 / 60.0).abs() > 0.000001 {
                out.push(format!("M220 S{}", speed_factor * 60.0 * 100.0));
            }
            let extrude_factor = or_num(kv.get("extrude_factor"), 1.0);
            if extrude_factor != 1.0 {
                out.push(format!("M221 S{}", extrude_factor * 100.0));
            }
        }

        out.push("; End of state restore".to_string());
        out.push(String::new());
        out.push(String::new());
        self.state_preamble = out.join("\n");
    }

    /// Assemble the recovered script, if any commands were captured.
    pub fn build_artifact(&self) -> Option<OutputFile> {
        if self.commands.is_empty() {
            return None;
        }
        Some(OutputFile {
            filename: self.filename.clone(),
            content: format!("{}{}", self.state_preamble, self.commands.concat()),
        })
    }

    pub fn take_lines(&mut self) -> Vec<TimestampedLine> {
        std::mem::take(&mut self.lines)
    }
}

fn strip_quote_pair(quoted: &str) -> &str {
    let mut chars = quoted.chars();
    chars.next();
    let rest = chars.as_str();
    match rest.char_indices().last() {
        Some((idx, _)) => &rest[..idx],
        None => "",
    }
}

fn parse_param_value(raw: &str) -> ParamValue {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) {
        return json_to_param(v);
    }
    match raw {
        "True" | "true" => return ParamValue::Bool(true),
        "False" | "false" => return ParamValue::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<f64>() {
        return ParamValue::Num(n);
    }
    if raw.starts_with('[') && raw.ends_with(']') {
        let items = raw[1..raw.len() - 1]
            .split(',')
            .map(|item| item.trim().parse::<f64>().unwrap_or(f64::NAN))
            .collect();
        return ParamValue::List(items);
    }
    ParamValue::Str(raw.to_string())
}

fn json_to_param(value: serde_json::Value) -> ParamValue {
    match value {
        serde_json::Value::Null => ParamValue::Null,
        serde_json::Value::Bool(b) => ParamValue::Bool(b),
        serde_json::Value::Number(n) => ParamValue::Num(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => ParamValue::Str(s),
        serde_json::Value::Array(items) => ParamValue::List(
            items
                .into_iter()
                .map(|item| item.as_f64().unwrap_or(f64::NAN))
                .collect(),
        ),
        other => ParamValue::Str(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_capture() {
        let mut stream = GCodeStream::new(1, "printer");
        assert!(matches!(
            stream.claim(5, "Read 451.602146: 'G1 X110.086 Y117.684 E0.01648\\n'"),
            Claim::Consumed
        ));
        assert!(matches!(
            stream.claim(6, "Read 451.602900: 'M400\\n'"),
            Claim::Consumed
        ));
        assert!(matches!(stream.claim(7, "Stats 451.7: x=1"), Claim::Pass));

        assert_eq!(stream.commands[0], "G1 X110.086 Y117.684 E0.01648");
        assert_eq!(stream.commands[1], "M400");
        assert_eq!(stream.lines[0].time, 451.602146);
    }

    #[test]
    fn test_param_parsing_ladder() {
        let stream = GCodeStream::new(1, "printer");
        let kv = stream.extract_params(
            "gcode state: absolute_coord=True absolute_extrude=false speed=1500.0 \
             last_position=[291.3, 279.0, 10.0, 2.1] name=PrintJob",
        );
        assert_eq!(kv["absolute_coord"], ParamValue::Bool(true));
        assert_eq!(kv["absolute_extrude"], ParamValue::Bool(false));
        assert_eq!(kv["speed"], ParamValue::Num(1500.0));
        assert_eq!(
            kv["last_position"],
            ParamValue::List(vec![291.3, 279.0, 10.0, 2.1])
        );
        assert_eq!(kv["name"], ParamValue::Str("PrintJob".to_string()));
    }

    #[test]
    fn test_state_restore_preamble() {
        let mut stream = GCodeStream::new(1, "printer");
        stream.handle_state(
            "gcode state: absolute_coord=True absolute_extrude=True \
             base_position=[0.0, 0.0, 0.0, 0.0] last_position=[1.0, 2.0, 3.0, 4.0] \
             homing_position=[0.0, 0.0, 0.0, 0.0] speed=25.0 \
             speed_factor=0.016666666666666666 extrude_factor=1.0",
        );
        assert_eq!(
            stream.state_preamble,
            "; Start g-code state restore\nG28\nG1 X1 Y2 Z3 F1500\nG92 E4\n; End of state restore\n\n"
        );
    }

    #[test]
    fn test_state_restore_relative_modes_and_factors() {
        let mut stream = GCodeStream::new(1, "printer");
        stream.handle_state(
            "gcode state: absolute_coord=False absolute_extrude=False \
             base_position=[5.0, 0.0, 0.0, 1.0] last_position=[1.0, 2.0, 3.0, 4.0] \
             homing_position=[0.0, 0.0, 1.5, 0.0] speed=25.0 \
             speed_factor=0.03333333333333333 extrude_factor=0.95",
        );
        let lines: Vec<&str> = stream.state_preamble.lines().collect();
        assert_eq!(lines[2], "G91");
        assert_eq!(lines[3], "M83");
        assert_eq!(lines[4], "G1 X1 Y2 Z3 F1500");
        assert_eq!(lines[5], "; Must manually set base position...");
        assert_eq!(lines[6], "G92 E3");
        assert_eq!(lines[7], "; Must manually set homing position...");
        assert!(lines[8].starts_with("M220 S"));
        assert_eq!(lines[9], "M221 S95");
    }

    #[test]
    fn test_state_restore_skips_position_on_bad_vector() {
        let mut stream = GCodeStream::new(1, "printer");
        stream.handle_state("gcode state: last_position=[1.0, 2.0, 3.0] speed=25.0");
        assert!(!stream.state_preamble.contains("G1 "));
        assert!(stream.state_preamble.contains("G28"));
    }

    #[test]
    fn test_artifact_assembly() {
        let mut stream = GCodeStream::new(123, "printer");
        assert!(stream.build_artifact().is_none());

        stream.handle_state("gcode state: absolute_coord=True absolute_extrude=True");
        stream.claim(5, "Read 1.0: 'G28\\n'");
        stream.claim(6, "Read 1.5: 'G1 X1\\n'");

        let artifact = stream.build_artifact().expect("script should exist");
        assert_eq!(artifact.filename, "printer.gcode00123");
        assert!(artifact.content.starts_with("; Start g-code state restore\n"));
        assert!(artifact.content.ends_with("G28G1 X1"));
    }
}
