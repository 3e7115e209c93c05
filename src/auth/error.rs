use rocket::http::Status;
use thiserror::Error;

pub type AdminAuthResult<T> = Result<T, AdminAuthError>;

#[derive(Debug, Error)]
pub enum AdminAuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid admin token")]
    InvalidToken,
    #[error("configuration error: {0}")]
    Config(String),
}

impl AdminAuthError {
    pub fn status(&self) -> Status {
        match self {
            AdminAuthError::MissingToken | AdminAuthError::InvalidToken => Status::Unauthorized,
            AdminAuthError::Config(_) => Status::InternalServerError,
        }
    }
}
