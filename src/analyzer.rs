//! Single-pass line dispatcher and analysis session.
//!
//! One sequential scan over the log text: remembers recent lines for
//! incident context, recognizes section boundaries, and hands lines to at
//! most one active handler (config collector or shutdown assembler) at a
//! time. The whole pass is deterministic; analyzing the same text twice
//! yields byte-identical artifacts.

use std::collections::VecDeque;
use std::panic::catch_unwind;

use regex::Regex;

use crate::artifact::{
    format_comment, AnalyzeError, Extraction, CONFIG_SECTION_START,
};
use crate::config_dump::{ConfigCollector, ConfigSet};
use crate::shutdown::ShutdownAssembler;

// ============================================================================
// Tunables
// ============================================================================

/// Recent lines replayed into a new incident for context.
pub const MAX_RECENT_LINES: usize = 200;

/// An incident is closed once its statistics window spans this many seconds.
pub const INCIDENT_SPAN_SECS: f64 = 5.0;

/// Knobs for one analysis pass. The defaults match the firmware's observed
/// dump cadence and are right for almost every log.
#[derive(Clone, Copy, Debug)]
pub struct AnalyzeOptions {
    pub recent_lines: usize,
    pub incident_span: f64,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            recent_lines: MAX_RECENT_LINES,
            incident_span: INCIDENT_SPAN_SECS,
        }
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Analyze a complete log text and return the extracted artifacts.
///
/// `logname` is the caller-supplied base name for output files; a trailing
/// extension is stripped. Malformed input never fails; the only error is an
/// internal fault during the pass.
pub fn analyze(contents: &str, logname: &str) -> Result<Extraction, AnalyzeError> {
    analyze_with(contents, logname, AnalyzeOptions::default())
}

/// [`analyze`] with explicit tunables.
pub fn analyze_with(
    contents: &str,
    logname: &str,
    options: AnalyzeOptions,
) -> Result<Extraction, AnalyzeError> {
    catch_unwind(|| Analyzer::new(logname, options).run(contents)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unexpected fault".to_string());
        AnalyzeError::Internal(message)
    })
}

// ============================================================================
// Session
// ============================================================================

enum Handler {
    Config(ConfigCollector),
    Shutdown(ShutdownAssembler),
}

/// State for one pass over one log.
struct Analyzer {
    logname: String,
    options: AnalyzeOptions,
    configs: ConfigSet,
    recent_lines: VecDeque<(usize, String)>,
    /// Version banner plus its follow-up lines, prepended as provenance
    /// comments to whatever artifact comes next.
    last_git_info: Vec<String>,
    last_start: Option<String>,
    handler: Option<Handler>,
    result: Extraction,
    provenance_re: Regex,
}

impl Analyzer {
    fn new(logname: &str, options: AnalyzeOptions) -> Self {
        Self {
            logname: strip_extension(logname).to_string(),
            options,
            configs: ConfigSet::new(),
            recent_lines: VecDeque::new(),
            last_git_info: Vec::new(),
            last_start: None,
            handler: None,
            result: Extraction::default(),
            provenance_re: Regex::new(r"^(?:Untracked|Modified|Branch|Remote|Tracked)").unwrap(),
        }
    }

    fn run(mut self, contents: &str) -> Extraction {
        for (idx, raw) in contents.split('\n').enumerate() {
            let line = raw.trim_end();
            let line_num = idx + 1;

            self.recent_lines.push_back((line_num, line.to_string()));
            if self.recent_lines.len() > self.options.recent_lines {
                self.recent_lines.pop_front();
            }

            let consumed = match self.handler.as_mut() {
                Some(Handler::Config(collector)) => {
                    Some(collector.add_line(&mut self.configs, line))
                }
                Some(Handler::Shutdown(assembler)) => Some(assembler.add_line(line_num, line)),
                None => None,
            };
            match consumed {
                Some(true) => continue,
                Some(false) => {
                    // The line that ended a handler may start the next one.
                    self.retire_handler();
                }
                None => {}
            }

            self.check_triggers(line_num, line);
        }

        // Force-finalize whatever is still open at end of input.
        if let Some(mut handler) = self.handler.take() {
            match &mut handler {
                Handler::Config(collector) => collector.finalize(&mut self.configs),
                Handler::Shutdown(assembler) => assembler.finalize(),
            }
            self.collect(handler);
        }

        let configs = std::mem::take(&mut self.configs);
        self.result.configs = configs.into_files();

        tracing::info!(
            "Extracted {} shutdown report(s), {} config(s), {} g-code file(s)",
            self.result.shutdowns.len(),
            self.result.configs.len(),
            self.result.gcode_files.len()
        );
        self.result
    }

    fn retire_handler(&mut self) {
        if let Some(handler) = self.handler.take() {
            self.collect(handler);
            self.recent_lines.clear();
        }
    }

    fn collect(&mut self, handler: Handler) {
        // A config collector registers itself into the dedup set; only
        // shutdown assemblers hand artifacts back directly.
        if let Handler::Shutdown(assembler) = handler {
            let (report, gcode) = assembler.into_artifacts();
            if let Some(report) = report {
                self.result.shutdowns.push(report);
            }
            if let Some(gcode) = gcode {
                self.result.gcode_files.push(gcode);
            }
        }
    }

    fn check_triggers(&mut self, line_num: usize, line: &str) {
        if line.starts_with("Git version") {
            self.last_git_info = vec![format_comment(line_num, line)];
        } else if self.provenance_re.is_match(line) {
            if !self.last_git_info.is_empty() {
                self.last_git_info.push(format_comment(line_num, line));
            }
        } else if line.starts_with("Start printer at") {
            self.last_start = Some(format_comment(line_num, line));
        } else if line == CONFIG_SECTION_START {
            let mut collector = ConfigCollector::new(&self.configs, line_num, &self.logname);
            for comment in &self.last_git_info {
                collector.add_comment(comment.clone());
            }
            if let Some(start) = &self.last_start {
                collector.add_comment(start.clone());
            }
            self.handler = Some(Handler::Config(collector));
        } else if line.contains("shutdown: ") || line.starts_with("Dumping ") {
            tracing::debug!(line_num, "shutdown incident detected");
            let mut assembler = ShutdownAssembler::new(
                &mut self.configs,
                line_num,
                &self.recent_lines,
                &self.logname,
                self.options.incident_span,
            );
            for comment in &self.last_git_info {
                assembler.add_comment(comment.clone());
            }
            if let Some(start) = &self.last_start {
                assembler.add_comment(start.clone());
            }
            self.handler = Some(Handler::Shutdown(assembler));
        }
    }
}

/// Strip a trailing `.<ext>` segment, mirroring how the artifacts of
/// `printer.log` are named `printer.*`.
fn strip_extension(logname: &str) -> &str {
    match logname.rfind('.') {
        Some(idx) if idx + 1 < logname.len() && !logname[idx + 1..].contains(['.', '/']) => {
            &logname[..idx]
        }
        _ => logname,
    }
}
