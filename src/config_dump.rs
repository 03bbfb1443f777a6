//! Configuration dump capture and deduplication.
//!
//! Full config-file dumps reappear in the log every time the firmware
//! restarts. Identical dumps are collapsed into one artifact that carries a
//! provenance comment per occurrence, keyed by the exact joined body text.
//! Ordinals (and therefore filenames) are assigned at first appearance and
//! never move.

use std::collections::HashMap;

use regex::Regex;

use crate::artifact::{format_comment, OutputFile, CONFIG_SECTION_END, LOG_ROLLOVER_PATTERN};

/// One unique configuration snapshot.
pub struct ConfigArtifact {
    filename: String,
    lines: Vec<String>,
    comments: Vec<String>,
}

impl ConfigArtifact {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn add_comment(&mut self, comment: String) {
        self.comments.push(comment);
    }

    fn write_file(&self) -> OutputFile {
        let mut content = String::new();
        for line in self.comments.iter().chain(self.lines.iter()) {
            content.push_str(line);
            content.push('\n');
        }
        OutputFile {
            filename: self.filename.clone(),
            content,
        }
    }
}

/// All unique configurations seen so far, in insertion order.
#[derive(Default)]
pub struct ConfigSet {
    by_content: HashMap<String, usize>,
    artifacts: Vec<ConfigArtifact>,
}

impl ConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// The most recently registered configuration, used to cross-reference
    /// shutdown reports against the config that was live at the time.
    pub fn latest_mut(&mut self) -> Option<&mut ConfigArtifact> {
        self.artifacts.last_mut()
    }

    /// Flush to concrete files, in first-appearance order.
    pub fn into_files(self) -> Vec<OutputFile> {
        self.artifacts.iter().map(ConfigArtifact::write_file).collect()
    }
}

/// Collects the body of one config dump section until its terminator.
pub struct ConfigCollector {
    start_line_num: usize,
    filename: String,
    lines: Vec<String>,
    comments: Vec<String>,
    rollover_re: Regex,
}

impl ConfigCollector {
    pub fn new(configs: &ConfigSet, line_num: usize, logname: &str) -> Self {
        let ordinal = configs.len() + 1;
        Self {
            start_line_num: line_num,
            filename: format!("{}.config{:04}.cfg", logname, ordinal),
            lines: Vec::new(),
            comments: Vec::new(),
            rollover_re: Regex::new(LOG_ROLLOVER_PATTERN).unwrap(),
        }
    }

    pub fn add_comment(&mut self, comment: String) {
        self.comments.push(comment);
    }

    /// Returns false once the terminator closed the section and the capture
    /// has been registered.
    pub fn add_line(&mut self, configs: &mut ConfigSet, line: &str) -> bool {
        if line != CONFIG_SECTION_END && !self.rollover_re.is_match(line) {
            self.lines.push(line.to_string());
            return true;
        }
        self.finalize(configs);
        false
    }

    /// Register the capture, merging into an existing artifact when the body
    /// text is byte-identical.
    pub fn finalize(&mut self, configs: &mut ConfigSet) {
        let key = self.lines.join("\n");
        let occurrence = format_comment(self.start_line_num, "config file");
        match configs.by_content.get(&key) {
            Some(&idx) => {
                let existing = &mut configs.artifacts[idx];
                existing.comments.append(&mut self.comments);
                existing.comments.push(occurrence);
            }
            None => {
                let mut comments = std::mem::take(&mut self.comments);
                comments.push(occurrence);
                configs.by_content.insert(key, configs.artifacts.len());
                configs.artifacts.push(ConfigArtifact {
                    filename: std::mem::take(&mut self.filename),
                    lines: std::mem::take(&mut self.lines),
                    comments,
                });
            }
        }
    }
}
