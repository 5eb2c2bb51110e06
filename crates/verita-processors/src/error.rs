use verita_core::JobError;

/// Failure talking to a detection provider.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Missing credentials for processor '{0}'")]
    MissingCredentials(String),

    #[error("Provider rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Provider unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("Provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessorError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ProcessorError::Rejected { status, body },
            429 | 500..=599 => ProcessorError::Unavailable { status, body },
            _ => ProcessorError::Rejected { status, body },
        }
    }

    /// Worth retrying later: provider overload or a transient network failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessorError::Unavailable { .. } => true,
            ProcessorError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProcessorError::Other(_) => true,
            ProcessorError::MissingCredentials(_)
            | ProcessorError::Rejected { .. }
            | ProcessorError::InvalidResponse(_) => false,
        }
    }

    /// Short code stored as the `error` of a failed row.
    pub fn code(&self) -> &'static str {
        match self {
            ProcessorError::MissingCredentials(_) => "missing_credentials",
            ProcessorError::Rejected { status: 401 | 403, .. } => "unauthorized",
            ProcessorError::Rejected { .. } => "rejected",
            ProcessorError::Unavailable { .. } => "unavailable",
            ProcessorError::Transport(_) => "transport",
            ProcessorError::InvalidResponse(_) => "invalid_response",
            ProcessorError::Other(_) => "internal",
        }
    }
}

impl From<ProcessorError> for JobError {
    fn from(err: ProcessorError) -> Self {
        if err.is_retryable() {
            JobError::recoverable(err)
        } else {
            JobError::unrecoverable(err)
        }
    }
}
