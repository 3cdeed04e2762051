use chrono::NaiveTime;
use rollcall_core::detector::DEFAULT_MIN_CONFIDENCE;
use rollcall_core::liveness::DEFAULT_LIVENESS_THRESHOLD;
use rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD;
use rollcall_core::{AttendanceWindow, EuclideanMatcher, PipelineSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{key} must be in (0, 1], got {value}")]
    OutOfRange { key: &'static str, value: f32 },
    #[error("{key}: cannot parse time '{value}' (expected HH:MM or HH:MM:SS)")]
    BadTime { key: &'static str, value: String },
    #[error(transparent)]
    Window(#[from] rollcall_core::attendance::WindowError),
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub liveness_model: String,
    pub embedder_model: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root for archived enrollment photos.
    pub storage_dir: PathBuf,
    pub min_detection_confidence: f32,
    /// Liveness scores below this are spoofs.
    pub liveness_threshold: f32,
    /// Euclidean distance below which the nearest identity is accepted.
    pub match_threshold: f32,
    pub window_opens: String,
    pub late_after: String,
    pub window_closes: String,
    /// Upper bound on one enroll or recognize request.
    pub inference_timeout_secs: u64,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".into(),
            liveness_model: "liveness_mobilenetv2.onnx".into(),
            embedder_model: "facenet_vggface2.onnx".into(),
            db_path: data_dir.join("rollcall.db"),
            storage_dir: data_dir.join("storage"),
            min_detection_confidence: DEFAULT_MIN_CONFIDENCE,
            liveness_threshold: DEFAULT_LIVENESS_THRESHOLD,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            window_opens: "06:00".into(),
            late_after: "08:00".into(),
            window_closes: "10:00".into(),
            inference_timeout_secs: 10,
            system_bus: false,
        }
    }
}

impl Config {
    /// Load and validate the configuration for this process.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `ROLLCALL_*` variables. Unparseable values keep the current setting.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let path = |key: &str, current: &mut PathBuf| {
            if let Some(v) = lookup(key) {
                *current = PathBuf::from(v);
            }
        };
        path("ROLLCALL_MODEL_DIR", &mut self.model_dir);
        path("ROLLCALL_DB_PATH", &mut self.db_path);
        path("ROLLCALL_STORAGE_DIR", &mut self.storage_dir);

        let text = |key: &str, current: &mut String| {
            if let Some(v) = lookup(key) {
                *current = v;
            }
        };
        text("ROLLCALL_WINDOW_OPENS", &mut self.window_opens);
        text("ROLLCALL_LATE_AFTER", &mut self.late_after);
        text("ROLLCALL_WINDOW_CLOSES", &mut self.window_closes);

        self.min_detection_confidence =
            parsed(&lookup, "ROLLCALL_MIN_DETECTION_CONFIDENCE", self.min_detection_confidence);
        self.liveness_threshold = parsed(&lookup, "ROLLCALL_LIVENESS_THRESHOLD", self.liveness_threshold);
        self.match_threshold = parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.inference_timeout_secs =
            parsed(&lookup, "ROLLCALL_INFERENCE_TIMEOUT_SECS", self.inference_timeout_secs);
        if let Some(v) = lookup("ROLLCALL_SYSTEM_BUS") {
            match parse_flag(&v) {
                Some(flag) => self.system_bus = flag,
                None => tracing::warn!(value = %v, "ignoring unrecognised ROLLCALL_SYSTEM_BUS"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("min_detection_confidence", self.min_detection_confidence),
            ("liveness_threshold", self.liveness_threshold),
            ("match_threshold", self.match_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::OutOfRange { key, value });
            }
        }
        self.window()?;
        Ok(())
    }

    pub fn window(&self) -> Result<AttendanceWindow, ConfigError> {
        Ok(AttendanceWindow::new(
            parse_time("window_opens", &self.window_opens)?,
            parse_time("late_after", &self.late_after)?,
            parse_time("window_closes", &self.window_closes)?,
        )?)
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings, ConfigError> {
        Ok(PipelineSettings {
            liveness_threshold: self.liveness_threshold,
            matcher: EuclideanMatcher::new(self.match_threshold),
            window: self.window()?,
        })
    }

    pub fn detector_model_path(&self) -> String {
        self.model_path(&self.detector_model)
    }

    pub fn liveness_model_path(&self) -> String {
        self.model_path(&self.liveness_model)
    }

    pub fn embedder_model_path(&self) -> String {
        self.model_path(&self.embedder_model)
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(current)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_time(key: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| ConfigError::BadTime {
            key,
            value: value.to_string(),
        })
}
