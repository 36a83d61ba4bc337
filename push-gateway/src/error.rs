use crate::models::ProviderKind;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway-level error type
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown device {0}")]
    UnknownDevice(Uuid),

    #[error("unknown message {0}")]
    UnknownMessage(Uuid),

    #[error("{} provider is not configured", .0.as_str())]
    ProviderNotConfigured(ProviderKind),

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("store corruption: {0}")]
    StoreCorruption(String),

    #[error("no in-flight {} message registered for identifier {ident}", .kind.as_str())]
    CorrelationViolation { kind: ProviderKind, ident: u32 },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UnknownDevice(_) | GatewayError::UnknownMessage(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            GatewayError::ProviderNotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Store(_)
            | GatewayError::StoreCorruption(_)
            | GatewayError::CorrelationViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl actix_web::ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        GatewayError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "success": false,
            "message": self.to_string(),
        }))
    }
}
