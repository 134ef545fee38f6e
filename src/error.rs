use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("kv cache allocation failed: {0}")]
    Allocation(String),
    #[error("kv cache capacity exceeded: {requested} positions requested, capacity is {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },
    #[error("model execution failed: {0}")]
    Execution(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Configuration(_) | ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Allocation(_)
            | ServiceError::CapacityExceeded { .. }
            | ServiceError::Execution(_)
            | ServiceError::Tokenizer(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
