use thiserror::Error;

/// Failures raised by the matching engine and its input boundary.
///
/// Each variant maps to one entry of the skip ledger kept per batch; see
/// [`FusionError::kind`].
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl FusionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingInput(_) => "missing_input",
            Self::MalformedInput(_) | Self::DimensionMismatch { .. } | Self::Json(_) => {
                "malformed_input"
            }
            Self::Io(_) => "io",
            Self::WorkerPool(_) => "worker_pool",
        }
    }
}

pub type FusionResult<T> = Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::FusionError;

    #[test]
    fn dimension_mismatch_is_reported_as_malformed_input() {
        let err = FusionError::DimensionMismatch {
            expected: 4,
            found: 3,
        };
        assert_eq!(err.kind(), "malformed_input");
        assert_eq!(
            err.to_string(),
            "embedding dimension mismatch: expected 4, found 3"
        );
    }

    #[test]
    fn missing_input_keeps_its_own_kind() {
        let err = FusionError::MissingInput("label file a.txt".to_string());
        assert_eq!(err.kind(), "missing_input");
    }
}
