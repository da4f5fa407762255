//! Error types shared across the retrieval core.

use thiserror::Error;

/// Errors surfaced by the retrieval core.
///
/// Agent-tool failures never appear here: tools report errors structurally
/// inside their results so a bad tool call degrades to zero candidates
/// instead of aborting the round.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path escapes repository root: {0}")]
    PathUnsafe(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("index missing for repository '{0}'")]
    IndexMissing(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("tool error: {0}")]
    Tool(String),

    #[error("line budget exceeded")]
    BudgetExceeded,

    #[error("llm failure: {0}")]
    LlmFailure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = CoreError::IndexMissing("repoA".into());
        assert_eq!(e.to_string(), "index missing for repository 'repoA'");

        let e = CoreError::DimensionMismatch { expected: 384, got: 256 };
        assert!(e.to_string().contains("expected 384"));
        assert!(e.to_string().contains("got 256"));
    }

    #[test]
    fn test_from_io_and_json() {
        fn read_missing() -> Result<String> {
            Ok(std::fs::read_to_string("/nonexistent/codequery-test-file")?)
        }
        assert!(matches!(read_missing(), Err(CoreError::Io(_))));

        fn parse_bad() -> Result<serde_json::Value> {
            Ok(serde_json::from_str("not json")?)
        }
        assert!(matches!(parse_bad(), Err(CoreError::Json(_))));
    }
}
