use std::path::PathBuf;

use rollcall_core::detector::DEFAULT_DETECTION_CONFIDENCE;
use rollcall_core::matcher::{DEFAULT_COSINE_THRESHOLD, DEFAULT_EUCLIDEAN_THRESHOLD};
use rollcall_core::{DetectorBackend, DistanceMetric, EmbedderConfig, EmbeddingModel, MatchPolicy};

/// Engine configuration, loaded from `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub detector: DetectorBackend,
    pub embedding_model: EmbeddingModel,
    pub metric: DistanceMetric,
    /// Maximum cosine distance accepted as a match.
    pub threshold_cosine: f64,
    /// Maximum euclidean distance accepted as a match.
    pub threshold_euclidean: f64,
    /// Minimum SCRFD score for a detection.
    pub detection_confidence: f32,
    /// ONNX Runtime intra-op threads per model.
    pub intra_threads: usize,
}

impl Config {
    /// Load configuration from the environment, falling back to defaults for
    /// unset or unparsable values.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            model_dir: std::env::var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("models")),
            db_path: std::env::var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("rollcall.db")),
            detector: env_parse("ROLLCALL_DETECTOR", DetectorBackend::Scrfd),
            embedding_model: env_parse("ROLLCALL_EMBEDDING_MODEL", EmbeddingModel::Facenet),
            metric: env_parse("ROLLCALL_DISTANCE_METRIC", DistanceMetric::Cosine),
            threshold_cosine: env_parse("ROLLCALL_THRESHOLD_COSINE", DEFAULT_COSINE_THRESHOLD),
            threshold_euclidean: env_parse("ROLLCALL_THRESHOLD_EUCLIDEAN", DEFAULT_EUCLIDEAN_THRESHOLD),
            detection_confidence: env_parse("ROLLCALL_DETECTION_CONFIDENCE", DEFAULT_DETECTION_CONFIDENCE),
            intra_threads: env_parse("ROLLCALL_INTRA_THREADS", 2),
        }
    }

    /// Threshold for the configured metric.
    pub fn match_policy(&self) -> MatchPolicy {
        let threshold = match self.metric {
            DistanceMetric::Cosine => self.threshold_cosine,
            DistanceMetric::Euclidean => self.threshold_euclidean,
        };
        MatchPolicy::new(self.metric, threshold)
    }

    pub fn embedder_config(&self) -> EmbedderConfig {
        EmbedderConfig {
            model_dir: self.model_dir.clone(),
            detector: self.detector,
            model: self.embedding_model,
            detection_confidence: self.detection_confidence,
            intra_threads: self.intra_threads.max(1),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, value = %raw, error = %e, "ignoring invalid setting");
                default
            }
        },
        Err(_) => default,
    }
}
