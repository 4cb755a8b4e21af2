//! Daily Markdown journals.
//!
//! - `analysis_YYYY-MM-DD.md`: one section per triggered analysis bundle.
//! - `<backend>_YYYY-MM-DD.md`: one section per direct single-backend query,
//!   successful or not.

use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::StorageError;
use crate::types::{AnalysisBundle, BackendId, BackendResult};

/// One direct query against a single backend.
#[derive(Debug, Clone)]
pub struct DirectEntry {
    pub timestamp: DateTime<Utc>,
    pub top_features: Vec<String>,
    pub note: Option<String>,
    pub result: BackendResult,
}

impl DirectEntry {
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(
            md,
            "## {} ({})\n",
            self.result.backend_id,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let _ = writeln!(md, "- Status: {:?}", self.result.status);
        let _ = writeln!(
            md,
            "- Duration: {:.1}s ({} attempt{})",
            self.result.elapsed_ms as f64 / 1000.0,
            self.result.attempts,
            if self.result.attempts == 1 { "" } else { "s" }
        );
        let features = if self.top_features.is_empty() {
            "none".to_string()
        } else {
            self.top_features.join(", ")
        };
        let _ = writeln!(md, "- Top features: {features}");
        if let Some(note) = &self.note {
            let _ = writeln!(md, "- Operator note: {}", note.trim());
        }
        let heading = if self.result.is_success() { "Analysis" } else { "Error" };
        let _ = writeln!(md, "\n### {heading}\n\n{}\n", self.result.text.trim());
        md
    }
}

#[derive(Debug, Clone)]
pub struct MarkdownJournal {
    dir: PathBuf,
}

impl MarkdownJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, bundle: &AnalysisBundle) -> PathBuf {
        self.dir
            .join(format!("analysis_{}.md", bundle.timestamp.format("%Y-%m-%d")))
    }

    pub fn direct_path_for(&self, backend: &BackendId, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}_{}.md", file_stem(backend.as_str()), at.format("%Y-%m-%d")))
    }

    /// Append the bundle's Markdown to its day's file, creating it as needed.
    pub fn append(&self, bundle: &AnalysisBundle) -> Result<PathBuf, StorageError> {
        let path = self.path_for(bundle);
        self.append_section(&path, &bundle.to_markdown())?;
        Ok(path)
    }

    /// Append a direct query to its backend's file for the day.
    pub fn append_direct(&self, entry: &DirectEntry) -> Result<PathBuf, StorageError> {
        let path = self.direct_path_for(&entry.result.backend_id, entry.timestamp);
        self.append_section(&path, &entry.to_markdown())?;
        Ok(path)
    }

    fn append_section(&self, path: &Path, markdown: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}\n\n---\n", markdown.trim_end())?;
        Ok(())
    }
}

/// Backend ids come from config; keep them to a safe file name.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorKind, TriggerReason};
    use chrono::TimeZone;

    #[test]
    fn test_appends_to_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let journal = MarkdownJournal::new(dir.path().join("journal"));
        let bundle = AnalysisBundle {
            id: 7,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap(),
            sequence_index: 3,
            trigger_reason: TriggerReason::StateChanged,
            feature_comparison: "Top 0 Contributing Features (Fault vs Normal):".into(),
            top_features: Vec::new(),
            results: Default::default(),
        };

        let path = journal.append(&bundle).unwrap();
        journal.append(&bundle).unwrap();

        assert!(path.ends_with("analysis_2024-03-09.md"));
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.matches("\n---\n").count(), 2);
    }

    #[test]
    fn test_direct_queries_logged_per_backend() {
        let dir = tempfile::tempdir().unwrap();
        let journal = MarkdownJournal::new(dir.path());
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 8, 30, 0).unwrap();

        let ok = DirectEntry {
            timestamp: at,
            top_features: vec!["Reactor Pressure".into(), "Stripper Level".into()],
            note: Some("after valve swap".into()),
            result: BackendResult::success("lm/studio".into(), "Cooling water valve stuck.".into(), 2_500, 1),
        };
        let failed = DirectEntry {
            timestamp: at,
            top_features: vec!["Reactor Pressure".into()],
            note: None,
            result: BackendResult::failure("lm/studio".into(), ErrorKind::Timeout, "no response within 45s", 45_000, 1),
        };

        let path = journal.append_direct(&ok).unwrap();
        assert_eq!(journal.append_direct(&failed).unwrap(), path);
        assert!(path.ends_with("lm_studio_2024-03-09.md"));

        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.matches("\n---\n").count(), 2);
        assert!(text.contains("- Status: Success"));
        assert!(text.contains("- Duration: 2.5s (1 attempt)"));
        assert!(text.contains("- Top features: Reactor Pressure, Stripper Level"));
        assert!(text.contains("Cooling water valve stuck."));
        assert!(text.contains("- Status: Timeout"));
        assert!(text.contains("### Error\n\nno response within 45s"));
    }
}
