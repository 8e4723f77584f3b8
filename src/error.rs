use std::path::PathBuf;

use thiserror::Error;

use crate::service::ServiceError;

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Corrupt checkpoint {}: {message}", path.display())]
    Checkpoint { path: PathBuf, message: String },

    #[error("Job service error: {0}")]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ResearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ResearchError::Config("missing endpoint".into());
        assert_eq!(err.to_string(), "Config error: missing endpoint");
    }

    #[test]
    fn checkpoint_error_names_the_file() {
        let err = ResearchError::Checkpoint {
            path: PathBuf::from("out/analysis/analysis_batch_results.json"),
            message: "expected value at line 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Corrupt checkpoint out/analysis/analysis_batch_results.json: expected value at line 1"
        );
    }

    #[test]
    fn service_error_converts() {
        let err: ResearchError = ServiceError::NotFound("thread_1".into()).into();
        assert_eq!(err.to_string(), "Job service error: not found: thread_1");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ResearchError>();
    }
}
