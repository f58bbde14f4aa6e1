//! Shared state document: the JSON record the dashboard polls.
//!
//! Writers hold a process-wide lock around each read-modify-write cycle and
//! replace the file atomically. Readers treat a missing or unparseable
//! document as "nothing yet".

use crate::protocol::{write_json_atomic, AnalysisResult, Concentration};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Key the latest analysis result is stored under.
pub const ANALYSIS_KEY: &str = "analysis";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to write state {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("state lock poisoned")]
    Poisoned,
}

/// Handle on the shared state document. Clones share one lock.
#[derive(Debug, Clone)]
pub struct SharedStatePublisher {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl SharedStatePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store `result` under [`ANALYSIS_KEY`], keeping every other key.
    pub fn merge_and_publish(&self, result: &AnalysisResult) -> Result<(), StateError> {
        let value = serde_json::to_value(result)?;
        self.update(|doc| {
            doc.insert(ANALYSIS_KEY.to_string(), value);
        })
    }

    /// Run one locked read-modify-write cycle over the document.
    pub fn update<F>(&self, apply: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let _guard = self.lock.lock().map_err(|_| StateError::Poisoned)?;
        let mut doc = read_document(&self.path);
        apply(&mut doc);
        write_json_atomic(&self.path, &Value::Object(doc)).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Current document contents, empty if missing or corrupt.
    pub fn read(&self) -> Map<String, Value> {
        let _guard = self.lock.lock();
        read_document(&self.path)
    }
}

fn read_document(path: &Path) -> Map<String, Value> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "state document unreadable; starting empty");
            }
            return Map::new();
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::warn!(path = %path.display(), "state document corrupt; starting empty");
            Map::new()
        }
    }
}

/// What the dashboard shows for the latest analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub concentration: Concentration,
    pub is_sleeping: bool,
    pub subject_label: Option<String>,
    pub run_id: Option<String>,
    /// Message of a failed analysis run.
    pub error: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            concentration: Concentration::Unknown,
            is_sleeping: false,
            subject_label: None,
            run_id: None,
            error: None,
        }
    }
}

impl StatusSnapshot {
    /// Read the latest analysis from the document at `path`.
    ///
    /// `None` means the document is missing or mid-write; retry later.
    /// A document without an analysis yields the placeholder defaults.
    pub fn read(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        let doc: Value = serde_json::from_str(&text).ok()?;
        let Some(analysis) = doc.get(ANALYSIS_KEY) else {
            return Some(Self::default());
        };

        let snapshot = match serde_json::from_value::<AnalysisResult>(analysis.clone()) {
            Ok(AnalysisResult::Ok(report)) => Self {
                concentration: report.analysis.concentration,
                is_sleeping: report.analysis.is_sleeping,
                subject_label: report.input_summary.map(|s| s.subject_label),
                run_id: report.run_id,
                error: None,
            },
            Ok(AnalysisResult::Error(failure)) => Self {
                run_id: failure.run_id,
                error: Some(failure.message),
                ..Self::default()
            },
            Err(e) => {
                tracing::debug!(error = %e, "stored analysis has unexpected shape");
                Self::default()
            }
        };
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AnalysisFailure, AnalysisReport, AnalysisSummary, InputSummary};

    fn ok_result(concentration: Concentration) -> AnalysisResult {
        AnalysisResult::Ok(AnalysisReport {
            run_id: Some("run-1".into()),
            processed_at: None,
            analysis: AnalysisSummary {
                is_sleeping: true,
                concentration,
                metrics: None,
            },
            input_summary: Some(InputSummary {
                subject_label: "alice".into(),
                latest_ear: Some(0.1),
                latest_mar: Some(0.2),
            }),
            remote_run_id: None,
        })
    }

    #[test]
    fn test_merge_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"lights":"on","analysis":{"status":"error","message":"old"}}"#).unwrap();

        let publisher = SharedStatePublisher::new(&path);
        publisher.merge_and_publish(&ok_result(Concentration::Zone)).unwrap();

        let doc = publisher.read();
        assert_eq!(doc["lights"], "on");
        assert_eq!(doc[ANALYSIS_KEY]["status"], "ok");
        assert_eq!(doc[ANALYSIS_KEY]["analysis"]["concentration"], "zone");
    }

    #[test]
    fn test_merge_over_missing_or_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let publisher = SharedStatePublisher::new(&path);
        publisher.merge_and_publish(&ok_result(Concentration::Low)).unwrap();
        assert!(publisher.read().contains_key(ANALYSIS_KEY));

        std::fs::write(&path, "{ not json").unwrap();
        publisher.merge_and_publish(&ok_result(Concentration::High)).unwrap();
        let doc = publisher.read();
        assert_eq!(doc.len(), 1);
        assert_eq!(doc[ANALYSIS_KEY]["analysis"]["concentration"], "high");
    }

    #[test]
    fn test_snapshot_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert_eq!(StatusSnapshot::read(&path), None);

        std::fs::write(&path, "{\"analysis\": {\"sta").unwrap();
        assert_eq!(StatusSnapshot::read(&path), None);

        std::fs::write(&path, "{}").unwrap();
        assert_eq!(StatusSnapshot::read(&path), Some(StatusSnapshot::default()));
    }

    #[test]
    fn test_snapshot_reads_published_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let publisher = SharedStatePublisher::new(&path);
        publisher.merge_and_publish(&ok_result(Concentration::Medium)).unwrap();

        let snap = StatusSnapshot::read(&path).unwrap();
        assert_eq!(snap.concentration, Concentration::Medium);
        assert!(snap.is_sleeping);
        assert_eq!(snap.subject_label.as_deref(), Some("alice"));
        assert_eq!(snap.run_id.as_deref(), Some("run-1"));

        publisher
            .merge_and_publish(&AnalysisResult::Error(AnalysisFailure {
                message: "bad request".into(),
                run_id: None,
                processed_at: None,
            }))
            .unwrap();
        let snap = StatusSnapshot::read(&path).unwrap();
        assert_eq!(snap.error.as_deref(), Some("bad request"));
        assert_eq!(snap.concentration, Concentration::Unknown);
    }
}
