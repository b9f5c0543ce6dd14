use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD detection model.
    pub detector_model: PathBuf,
    /// 68-point landmark model.
    pub landmark_model: PathBuf,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Upper bound on a single Merge request, in seconds.
    pub merge_timeout_secs: u64,
    /// Warped-mask binarization threshold.
    pub mask_threshold: u8,
}

impl Config {
    /// Load configuration from `FACEMERGE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = facemerge_core::default_model_dir();

        let detector_model = std::env::var("FACEMERGE_DETECTOR_MODEL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| model_dir.join(facemerge_core::DETECTOR_MODEL_FILE));
        let landmark_model = std::env::var("FACEMERGE_LANDMARK_MODEL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| model_dir.join(facemerge_core::LANDMARK_MODEL_FILE));

        Self {
            model_dir,
            detector_model,
            landmark_model,
            intra_threads: env_parse("FACEMERGE_THREADS", 4),
            merge_timeout_secs: env_parse("FACEMERGE_MERGE_TIMEOUT_SECS", 60),
            mask_threshold: env_parse("FACEMERGE_MASK_THRESHOLD", facemerge_core::pipeline::DEFAULT_MASK_THRESHOLD),
        }
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}

/// Parse `key`, falling back to `default` when unset or unparsable.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("FACEMERGE_TEST_GARBAGE_U64", "sixty");
        assert_eq!(env_parse("FACEMERGE_TEST_GARBAGE_U64", 60u64), 60);
    }

    #[test]
    fn test_env_parse_reads_value() {
        std::env::set_var("FACEMERGE_TEST_THREADS_VALUE", "8");
        assert_eq!(env_parse("FACEMERGE_TEST_THREADS_VALUE", 4usize), 8);
    }

    #[test]
    fn test_env_parse_unset_uses_default() {
        assert_eq!(env_parse("FACEMERGE_TEST_NEVER_SET", 10u8), 10);
    }

    #[test]
    fn test_model_paths_default_into_model_dir() {
        let config = Config::from_env();
        if std::env::var("FACEMERGE_DETECTOR_MODEL").is_err() {
            assert_eq!(config.detector_model, config.model_dir.join(facemerge_core::DETECTOR_MODEL_FILE));
        }
        assert_eq!(config.merge_timeout(), Duration::from_secs(config.merge_timeout_secs));
    }
}
