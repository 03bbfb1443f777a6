//! Output artifact types and shared section markers.
//!
//! Everything the analyzer produces is a plain `(filename, content)` text
//! pair, suitable for direct display, diffing, or byte-for-byte export.

use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Section markers
// ============================================================================

/// Line that opens a configuration dump section.
pub const CONFIG_SECTION_START: &str = "===== Config file =====";

/// Line that closes a configuration dump section.
pub const CONFIG_SECTION_END: &str = "=======================";

/// Marker emitted when the log file rolls over to a new file.
pub const LOG_ROLLOVER_PATTERN: &str =
    "=============== Log rollover at .* ===============";

// ============================================================================
// Artifacts
// ============================================================================

/// A single reconstructed output file.
#[derive(Clone, Debug, Serialize)]
pub struct OutputFile {
    pub filename: String,
    pub content: String,
}

/// Everything recovered from one analysis pass over a log.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Extraction {
    /// Shutdown incident reports, in order of detection.
    pub shutdowns: Vec<OutputFile>,
    /// Deduplicated configuration snapshots, in order of first appearance.
    pub configs: Vec<OutputFile>,
    /// Recovered g-code scripts, one per incident that replayed commands.
    pub gcode_files: Vec<OutputFile>,
}

impl Extraction {
    /// True when the pass produced no artifacts at all. This is a valid
    /// outcome for a log with no config dumps and no incidents.
    pub fn is_empty(&self) -> bool {
        self.shutdowns.is_empty() && self.configs.is_empty() && self.gcode_files.is_empty()
    }

    /// Iterate over every artifact in output order.
    pub fn iter(&self) -> impl Iterator<Item = &OutputFile> {
        self.shutdowns
            .iter()
            .chain(self.configs.iter())
            .chain(self.gcode_files.iter())
    }
}

/// Error surfaced when an analysis pass fails outright. Malformed input is
/// never an error; only an internal fault while processing is reported.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("log analysis failed: {0}")]
    Internal(String),
}

/// Render a provenance comment pointing back at a source line.
pub fn format_comment(line_num: usize, line: &str) -> String {
    format!("# {:>6}: {}", line_num, line)
}
