use psim_core::PipelineError;
use thiserror::Error;

/// Failures talking to a chat-completion or embedding endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response body: {0}")]
    Decode(String),
    #[error("response carried no choices")]
    EmptyResponse,
}

impl LlmError {
    /// Timeouts, rate limiting and server errors are retried; other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout => true,
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_decode() {
            LlmError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            LlmError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

impl From<LlmError> for PipelineError {
    fn from(err: LlmError) -> Self {
        PipelineError::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(LlmError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!LlmError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!LlmError::Status { status: 401, body: String::new() }.is_retryable());
        assert!(!LlmError::EmptyResponse.is_retryable());
        assert!(!LlmError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn converts_to_upstream() {
        let err: PipelineError = LlmError::Timeout.into();
        assert!(matches!(err, PipelineError::Upstream(_)));
    }
}
