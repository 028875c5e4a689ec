//! 统一错误模型
//! 定义认证核心的错误分类和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 应用错误类型
///
/// SessionExpired 与 ReuseDetected 对外均表现为"会话已过期"，
/// 但内部日志必须区分：后者意味着令牌可能被窃取
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Unknown refresh token")]
    InvalidRefreshToken,

    #[error("Session expired")]
    SessionExpired,

    #[error("Refresh token reuse detected")]
    ReuseDetected,

    #[error("Username or email already taken")]
    DuplicateUsername,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Resource not found")]
    NotFound,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized
            | AppError::InvalidRefreshToken
            | AppError::SessionExpired
            | AppError::ReuseDetected => StatusCode::UNAUTHORIZED,
            AppError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::DuplicateUsername => StatusCode::CONFLICT,
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 获取用户可见的错误消息（不包含敏感信息）
    ///
    /// 未知用户与密码错误必须不可区分；未知刷新令牌同样归入通用认证失败
    pub fn user_message(&self) -> String {
        match self {
            AppError::Unauthorized | AppError::InvalidRefreshToken => {
                "Authentication failed".to_string()
            }
            AppError::SessionExpired | AppError::ReuseDetected => {
                "Session expired, please log in again".to_string()
            }
            AppError::RateLimitExceeded => "Too many attempts, try again later".to_string(),
            AppError::DuplicateUsername => "Username or email already taken".to_string(),
            AppError::Validation(msg) | AppError::BadRequest(msg) => msg.clone(),
            AppError::NotFound => "Resource not found".to_string(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        // 按严重程度分级记录
        match &self {
            AppError::ReuseDetected => {
                tracing::warn!(
                    request_id = %request_id,
                    "Refresh token reuse detected, chain revoked"
                );
            }
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                tracing::error!(
                    code = self.code(),
                    message = %self,
                    request_id = %request_id,
                    "Application error"
                );
            }
            _ => {
                tracing::debug!(
                    code = self.code(),
                    message = %self,
                    request_id = %request_id,
                    "Request rejected"
                );
            }
        }

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                request_id,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 从请求体校验错误转换
impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}
