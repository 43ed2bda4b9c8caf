use thiserror::Error;

use crate::rate_limit::RateLimitDecision;

/// Errors surfaced by the pipeline without mutating any record.
///
/// Generation failures (`TimedOut`, provider errors) are not transport
/// errors: they mutate the in-flight unit to `failed` and are reported
/// through `StageOutcome::Failed` so callers can still see the resulting
/// status and progress.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("caller does not own this resource")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("rate limit exceeded, resets at {}", .0.reset_at)]
    RateLimited(RateLimitDecision),

    #[error("persistence failure")]
    Persistence(#[source] anyhow::Error),
}

impl PipelineError {
    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_stable() {
        let err = PipelineError::Validation("description is required".to_string());
        assert_eq!(err.to_string(), "invalid request: description is required");

        let err = PipelineError::NotFound("ebook");
        assert_eq!(err.to_string(), "ebook not found");
    }
}
