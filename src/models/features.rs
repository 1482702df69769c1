use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Symbol additions detected in script-like files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub functions: usize,
    pub classes: usize,
    pub exports: usize,
}

impl SymbolSummary {
    pub fn total(&self) -> usize {
        self.functions + self.classes + self.exports
    }

    pub fn add(&mut self, other: &SymbolSummary) {
        self.functions += other.functions;
        self.classes += other.classes;
        self.exports += other.exports;
    }
}

/// Structured view of one unified diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffFeatureSummary {
    pub total_files: usize,
    pub code_files: usize,
    pub doc_files: usize,
    pub test_files: usize,
    pub config_files: usize,
    pub renames: usize,
    pub additions: usize,
    pub deletions: usize,
    pub hunks: usize,
    /// Distinct extensions among files classified as code.
    pub languages: usize,
    pub extensions: BTreeMap<String, usize>,
    pub dependency_changes: bool,
    pub security_sensitive: bool,
    pub symbols: Option<SymbolSummary>,
    pub paths: Vec<String>,
}

impl DiffFeatureSummary {
    pub fn changed_lines(&self) -> usize {
        self.additions + self.deletions
    }

    pub fn is_empty(&self) -> bool {
        self.total_files == 0 && self.changed_lines() == 0 && self.hunks == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Code,
    Doc,
    Test,
    Config,
}

pub fn extension_of(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}
