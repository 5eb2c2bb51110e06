use uuid::Uuid;

use verita_core::AppError;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Media not found: {0}")]
    MediaNotFound(Uuid),

    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("Processor '{0}' does not accept webhooks")]
    NotWebhook(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::MediaNotFound(_) | CoordinatorError::UnknownProcessor(_) => {
                AppError::NotFound(err.to_string())
            }
            CoordinatorError::NotWebhook(_) => AppError::BadRequest(err.to_string()),
            CoordinatorError::Other(e) => AppError::InternalWithSource {
                message: "Analysis coordination failed".to_string(),
                source: e,
            },
        }
    }
}
