use std::env;

pub use common::{Environment, LogLevel};

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 8;
const FALLBACK_WORKERS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub environment: Environment,
    pub log_level: LogLevel,
    pub workers: usize,
    pub model_name: String,
    pub ontology_version: String,
    pub default_text_prompt: String,
    /// Reject tiles whose samples are all zero.
    pub enable_fault_detection: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("ENVIRONMENT")
            .map(|s| Environment::parse(&s))
            .unwrap_or(Environment::Development);

        let log_level = lookup("LOG_LEVEL")
            .map(|s| LogLevel::parse(&s))
            .unwrap_or(LogLevel::Info);

        let workers = lookup("MASK_POLYGON_WORKERS")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_else(default_workers);

        let model_name = lookup("MODEL_NAME").unwrap_or_else(|| "sam3".to_string());

        let ontology_version =
            lookup("ONTOLOGY_VERSION").unwrap_or_else(|| "1.0.0".to_string());

        let default_text_prompt =
            lookup("DEFAULT_TEXT_PROMPT").unwrap_or_else(|| "objects".to_string());

        let enable_fault_detection = lookup("ENABLE_FAULT_DETECTION")
            .map(|s| s.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            environment,
            log_level,
            workers: Self::clamp_workers(workers),
            model_name,
            ontology_version,
            default_text_prompt,
            enable_fault_detection,
        }
    }

    pub fn clamp_workers(workers: usize) -> usize {
        workers.clamp(MIN_WORKERS, MAX_WORKERS)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
}
