//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use tracing::error;

use crate::assembler::AssembleError;
use crate::chunk_store::ChunkWriteError;
use crate::naming::SessionIdError;
use crate::registry::RegistryError;
use crate::token::TokenRejection;

pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    Internal(String),
    /// 登记表与暂存区失步，属于程序缺陷而非普通 I/O 失败。
    Inconsistent(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, format!("Bad Parameter: {msg}")).into_response()
            }
            ApiError::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, format!("Forbidden: {msg}")).into_response()
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {msg}")).into_response()
            }
            ApiError::Inconsistent(msg) => {
                error!(reason = %msg, "internal consistency error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal consistency error: {msg}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<io::Error> for ApiError {
    fn from(err: io::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<SessionIdError> for ApiError {
    fn from(err: SessionIdError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<TokenRejection> for ApiError {
    fn from(err: TokenRejection) -> Self {
        ApiError::Forbidden(err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyCompleted | RegistryError::Expired => {
                ApiError::Conflict(err.to_string())
            }
            RegistryError::EmptyUpload
            | RegistryError::IndexOutOfRange { .. }
            | RegistryError::TotalMismatch { .. } => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<ChunkWriteError> for ApiError {
    fn from(err: ChunkWriteError) -> Self {
        match err {
            ChunkWriteError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            ChunkWriteError::Body(_) => ApiError::BadRequest(err.to_string()),
            ChunkWriteError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<AssembleError> for ApiError {
    fn from(err: AssembleError) -> Self {
        match err {
            AssembleError::MissingChunk { .. } => ApiError::Inconsistent(err.to_string()),
            AssembleError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
            AssembleError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}
