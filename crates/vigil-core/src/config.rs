use crate::preprocess::FacePreprocessor;
use crate::protocol::ExchangePaths;
use crate::registry::RegistrySettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Pipeline configuration.
///
/// Built from `VIGIL_*` environment variables, or from a TOML file with the
/// environment applied on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Directory holding the exchange files and shared state document.
    pub data_dir: PathBuf,
    /// Identity store root (one directory per identity). Defaults to
    /// `<data_dir>/known_faces`.
    pub store_dir: Option<PathBuf>,
    /// Shared state document read by the dashboard. Defaults to
    /// `<data_dir>/state.json`.
    pub state_path: Option<PathBuf>,
    /// Euclidean distance below which an embedding matches an identity.
    ///
    /// The scale depends on the embedder: 0.4 suits unnormalized 128-d
    /// descriptors. L2-normalized ArcFace vectors from `OnnxEmbedder` put the
    /// same person further apart (distance = sqrt(2 - 2 cos)), so raise this to
    /// roughly 1.0-1.2 when using that model.
    pub match_threshold: f32,
    /// Minimum seconds between two runtime identity registrations.
    pub unknown_cooldown_secs: f64,
    /// Pixels of context kept around a persisted face crop.
    pub crop_padding: u32,
    /// Trackers reporting a confidence below this are dropped.
    pub tracker_confidence_floor: f32,
    /// Feature samples handed to one analysis job.
    pub window_capacity: usize,
    /// Minimum seconds between two analysis job triggers.
    pub analysis_cooldown_secs: f64,
    /// Kill an analysis job running longer than this. Unset means never.
    pub analysis_timeout_secs: Option<f64>,
    /// Program spawned for each analysis job.
    pub analyzer_program: String,
    /// Extra arguments placed before `--request`/`--result`.
    pub analyzer_args: Vec<String>,
    pub canonical_face_size: u32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    /// EAR below this reads as eyes closed.
    pub ear_closed_threshold: f32,
    /// MAR above this reads as mouth open.
    pub mar_open_threshold: f32,
    /// |yaw| above this many degrees reads as facing sideways.
    pub yaw_facing_threshold: f32,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            store_dir: None,
            state_path: None,
            match_threshold: 0.4,
            unknown_cooldown_secs: 5.0,
            crop_padding: 20,
            tracker_confidence_floor: 7.0,
            window_capacity: 30,
            analysis_cooldown_secs: 5.0,
            analysis_timeout_secs: None,
            analyzer_program: "vigil-analyze".to_string(),
            analyzer_args: Vec::new(),
            canonical_face_size: 150,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            ear_closed_threshold: 0.20,
            mar_open_threshold: 0.5,
            yaw_facing_threshold: 15.0,
        }
    }
}

impl VigilConfig {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a TOML file, then apply `VIGIL_*` overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `VIGIL_*` overrides looked up through `var`. Unset store and
    /// state paths keep following `data_dir`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("VIGIL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("VIGIL_STORE_DIR") {
            self.store_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = var("VIGIL_STATE_PATH") {
            self.state_path = Some(PathBuf::from(path));
        }
        if let Some(program) = var("VIGIL_ANALYZER") {
            self.analyzer_program = program;
        }

        let parse = |key: &str| var(key).and_then(|v| v.parse::<f64>().ok());
        let set_f32 = |slot: &mut f32, key: &str| {
            if let Some(v) = parse(key) {
                *slot = v as f32;
            }
        };
        set_f32(&mut self.match_threshold, "VIGIL_MATCH_THRESHOLD");
        set_f32(&mut self.tracker_confidence_floor, "VIGIL_TRACKER_FLOOR");
        set_f32(&mut self.ear_closed_threshold, "VIGIL_EAR_THRESHOLD");
        set_f32(&mut self.mar_open_threshold, "VIGIL_MAR_THRESHOLD");
        set_f32(&mut self.yaw_facing_threshold, "VIGIL_YAW_THRESHOLD");
        if let Some(v) = parse("VIGIL_UNKNOWN_COOLDOWN_SECS") {
            self.unknown_cooldown_secs = v;
        }
        if let Some(v) = parse("VIGIL_ANALYSIS_COOLDOWN_SECS") {
            self.analysis_cooldown_secs = v;
        }
        if let Some(secs) = parse("VIGIL_ANALYSIS_TIMEOUT_SECS") {
            self.analysis_timeout_secs = (secs > 0.0).then_some(secs);
        }
        if let Some(v) = var("VIGIL_CROP_PADDING").and_then(|v| v.parse().ok()) {
            self.crop_padding = v;
        }
        if let Some(v) = var("VIGIL_WINDOW_CAPACITY").and_then(|v| v.parse().ok()) {
            self.window_capacity = v;
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("known_faces"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("state.json"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.window_capacity == 0 {
            return invalid("window_capacity must be at least 1");
        }
        if !(self.match_threshold > 0.0) {
            return invalid("match_threshold must be positive");
        }
        if !(self.tracker_confidence_floor >= 0.0) {
            return invalid("tracker_confidence_floor must not be negative");
        }
        if !(self.unknown_cooldown_secs >= 0.0) || !(self.analysis_cooldown_secs >= 0.0) {
            return invalid("cooldowns must not be negative");
        }
        if matches!(self.analysis_timeout_secs, Some(t) if !(t > 0.0)) {
            return invalid("analysis_timeout_secs must be positive when set");
        }
        if self.analyzer_program.trim().is_empty() {
            return invalid("analyzer_program must not be empty");
        }
        if self.canonical_face_size == 0 || self.clahe_tiles == 0 {
            return invalid("canonical_face_size and clahe_tiles must be at least 1");
        }
        Ok(())
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            match_threshold: self.match_threshold,
            unknown_cooldown: secs(self.unknown_cooldown_secs),
            crop_padding: self.crop_padding,
        }
    }

    pub fn preprocessor(&self) -> FacePreprocessor {
        FacePreprocessor {
            canonical_size: self.canonical_face_size,
            clahe_tiles: self.clahe_tiles,
            clahe_clip_limit: self.clahe_clip_limit,
        }
    }

    pub fn exchange_paths(&self) -> ExchangePaths {
        ExchangePaths::in_dir(&self.data_dir)
    }

    pub fn analysis_cooldown(&self) -> Duration {
        secs(self.analysis_cooldown_secs)
    }

    pub fn analysis_timeout(&self) -> Option<Duration> {
        self.analysis_timeout_secs.map(secs)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let c = VigilConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.window_capacity, 30);
        assert_eq!(c.registry_settings().unknown_cooldown, Duration::from_secs(5));
        assert_eq!(c.analysis_timeout(), None);
        assert!(c.exchange_paths().result.ends_with("analysis_result.json"));
    }

    #[test]
    fn test_load_toml_with_partial_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(
            &path,
            "window_capacity = 12\nanalysis_timeout_secs = 30.0\nanalyzer_args = [\"--verbose\"]\n",
        )
        .unwrap();

        let c = VigilConfig::load(&path).unwrap();
        assert_eq!(c.window_capacity, 12);
        assert_eq!(c.analysis_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(c.analyzer_args, vec!["--verbose".to_string()]);
        assert_eq!(c.match_threshold, 0.4);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "window_capacity = 0\n").unwrap();
        assert!(matches!(VigilConfig::load(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "window_capacity = \"many\"\n").unwrap();
        assert!(matches!(VigilConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_paths_follow_data_dir_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "data_dir = \"/var/vigil\"\n").unwrap();

        let c = VigilConfig::load(&path).unwrap();
        assert_eq!(c.store_dir(), PathBuf::from("/var/vigil/known_faces"));
        assert_eq!(c.state_path(), PathBuf::from("/var/vigil/state.json"));
        assert_eq!(c.exchange_paths().request, PathBuf::from("/var/vigil/analysis_request.json"));
    }

    #[test]
    fn test_data_dir_override_keeps_explicit_store_dir() {
        let mut c: VigilConfig = toml::from_str("store_dir = \"/srv/faces\"\n").unwrap();
        c.apply_overrides(|key| (key == "VIGIL_DATA_DIR").then(|| "/var/vigil".to_string()));

        assert_eq!(c.data_dir, PathBuf::from("/var/vigil"));
        assert_eq!(c.store_dir(), PathBuf::from("/srv/faces"));
        assert_eq!(c.state_path(), PathBuf::from("/var/vigil/state.json"));
    }

    #[test]
    fn test_overrides_parse_numbers_and_skip_garbage() {
        let mut c = VigilConfig::default();
        c.apply_overrides(|key| match key {
            "VIGIL_WINDOW_CAPACITY" => Some("12".into()),
            "VIGIL_MATCH_THRESHOLD" => Some("1.1".into()),
            "VIGIL_CROP_PADDING" => Some("lots".into()),
            "VIGIL_ANALYSIS_TIMEOUT_SECS" => Some("0".into()),
            _ => None,
        });
        assert_eq!(c.window_capacity, 12);
        assert!((c.match_threshold - 1.1).abs() < 1e-6);
        assert_eq!(c.crop_padding, 20);
        assert_eq!(c.analysis_timeout(), None);
        assert_eq!(c.store_dir(), PathBuf::from("./known_faces"));
    }

    #[test]
    fn test_validate_rejects_empty_program() {
        let c = VigilConfig {
            analyzer_program: "  ".into(),
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
