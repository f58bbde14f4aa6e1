//! File exchange protocol between the perception loop and the analysis process.
//!
//! The loop writes a request file and spawns the worker; the worker writes a
//! result file. Both sides write to a sibling temporary path and rename it
//! into place, so a reader never sees a half-written document.

use crate::types::FeatureSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Request document handed to the analysis process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub subject_label: String,
    /// Samples oldest first.
    pub time_series_data: Vec<FeatureSample>,
}

/// Result document written by the analysis process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisResult {
    Ok(AnalysisReport),
    Error(AnalysisFailure),
}

impl AnalysisResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, AnalysisResult::Ok(_))
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            AnalysisResult::Ok(r) => r.run_id.as_deref(),
            AnalysisResult::Error(f) => f.run_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub analysis: AnalysisSummary,
    #[serde(default)]
    pub input_summary: Option<InputSummary>,
    /// Run id reported by a remote analysis server, when one produced the summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub message: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Behavioral summary. Every field tolerates being absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisSummary {
    #[serde(default)]
    pub is_sleeping: bool,
    #[serde(default)]
    pub concentration: Concentration,
    #[serde(default)]
    pub metrics: Option<SeriesMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concentration {
    #[serde(alias = "Low")]
    Low,
    #[serde(alias = "Medium")]
    Medium,
    #[serde(alias = "High")]
    High,
    #[serde(alias = "Zone")]
    Zone,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Concentration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Concentration::Low => "low",
            Concentration::Medium => "medium",
            Concentration::High => "high",
            Concentration::Zone => "zone",
            Concentration::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Concentration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregates over one feature window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeriesMetrics {
    pub samples: usize,
    pub duration_secs: f64,
    pub mean_ear: f32,
    pub mean_mar: f32,
    pub eyes_closed_ratio: f32,
    pub blinks: u32,
    pub yawn_ratio: f32,
    pub mean_abs_yaw: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSummary {
    pub subject_label: String,
    pub latest_ear: Option<f32>,
    pub latest_mar: Option<f32>,
}

/// Where the loop and the worker exchange files.
#[derive(Debug, Clone)]
pub struct ExchangePaths {
    pub request: PathBuf,
    pub result: PathBuf,
    /// Worker stdout and stderr.
    pub log: PathBuf,
}

impl ExchangePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            request: dir.join("analysis_request.json"),
            result: dir.join("analysis_result.json"),
            log: dir.join("analysis.log"),
        }
    }
}

/// Write `bytes` to a temporary sibling of `path`, then rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, &bytes)
}
