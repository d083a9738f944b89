use axum::response::{IntoResponse, Response};
use http::StatusCode;

/// Error surface at the HTTP/WS edge only. Internal pipeline code propagates
/// `anyhow::Error` directly; this type exists to turn edge failures into
/// responses.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Forbidden(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn bad_request<T: ToString>(t: T) -> Self {
        AppError::BadRequest(t.to_string())
    }

    pub fn forbidden<T: ToString>(t: T) -> Self {
        AppError::Forbidden(t.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err).into_response(),
            AppError::Forbidden(err) => (StatusCode::FORBIDDEN, err).into_response(),
            AppError::InternalServerError(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError::InternalServerError(err.into())
    }
}
