use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Errors caused by the client's own input or lack of privilege. The symbolic
/// code is sent back verbatim in an `{"error": ...}` frame and the connection
/// stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("UserMustLogin")]
    UserMustLogin,
    #[error("RoomInvalid")]
    RoomInvalid,
    #[error("RoomAccessDenied")]
    RoomAccessDenied,
}

impl ClientError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserMustLogin => "UserMustLogin",
            Self::RoomInvalid => "RoomInvalid",
            Self::RoomAccessDenied => "RoomAccessDenied",
        }
    }
}

/// A command handler fails either because the client did something wrong or
/// because a shared dependency (directory, presence store, bus) did. Only the
/// former turns into an outbound frame.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        Self::Infra(err.into())
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n\n{}", self.0, self.0.backtrace()),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
