//! Job execution error types
//!
//! Lets job handlers and processor adapters say whether a failure is worth retrying
//! (provider overload, network hiccup) or must fail immediately (missing
//! credentials, a payload that will never parse).

use std::fmt;

/// Job execution error that can be either recoverable or unrecoverable
#[derive(Debug)]
pub struct JobError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl JobError {
    /// Create a new unrecoverable job error
    ///
    /// Unrecoverable errors fail the job immediately. Use this for:
    /// - Missing or invalid provider credentials
    /// - Input the provider rejects as invalid
    /// - Authorization errors
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// Create a new recoverable job error
    ///
    /// Recoverable errors become a retry directive for the job queue.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for JobError {
    /// Plain errors are treated as recoverable
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

/// Extension trait for Result to easily create unrecoverable job errors
pub trait JobResultExt<T> {
    fn unrecoverable(self) -> Result<T, JobError>;
}

impl<T, E: Into<anyhow::Error>> JobResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, JobError> {
        self.map_err(|e| JobError::unrecoverable(e.into()))
    }
}

/// True when an `anyhow::Error` wraps an unrecoverable [`JobError`].
pub fn is_unrecoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<JobError>()
        .map(|je| !je.is_recoverable())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecoverable_error() {
        let err = JobError::unrecoverable(anyhow::anyhow!("Missing API key"));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("Missing API key"));
    }

    #[test]
    fn test_from_anyhow_is_recoverable() {
        let err: JobError = anyhow::anyhow!("Some error").into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_result_ext() {
        let result: Result<(), anyhow::Error> = Err(anyhow::anyhow!("Config error"));
        assert!(!result.unrecoverable().unwrap_err().is_recoverable());
    }

    #[test]
    fn test_is_unrecoverable_through_anyhow() {
        let err: anyhow::Error = JobError::unrecoverable(anyhow::anyhow!("bad config")).into();
        assert!(is_unrecoverable(&err));
        assert!(!is_unrecoverable(&anyhow::anyhow!("generic")));
    }
}
