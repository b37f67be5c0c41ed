//! Errors raised while assembling the service.

use realtime_config_and_utils::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// A required collaborator was not supplied to the builder.
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] CoreError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
