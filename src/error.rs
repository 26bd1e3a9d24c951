use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("{0} が見つかりません")]
    NotFound(&'static str),

    #[error("二要素認証が設定されていません")]
    NotEnrolled,

    #[error("認証コードが無効です")]
    InvalidCode,

    #[error("承認がタイムアウトしました")]
    ApprovalTimeout,

    #[error("承認が拒否されました")]
    ApprovalDenied,

    #[error("アプリケーションのコールバックURLが未設定です")]
    MisconfiguredApp,

    #[error("競合: {0}")]
    Conflict(String),

    #[error("無効なトークンです")]
    InvalidToken,

    #[error("認証が必要です")]
    Unauthorized,

    #[error("外部チャネルが設定されていません")]
    ChannelUnavailable,

    #[error("外部チャネルエラー: {0}")]
    Channel(String),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("外部チャネル通信エラー")]
    ChannelHttp(#[from] reqwest::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        Self::Validation(report.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl AppError {
    /// HTTP ステータスコード
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::NotEnrolled => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidCode | Self::InvalidToken | Self::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            Self::ApprovalTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::ApprovalDenied => StatusCode::FORBIDDEN,
            Self::MisconfiguredApp => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ChannelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Channel(_) | Self::ChannelHttp(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Validation(msg) => msg.clone(),
            Self::Conflict(msg) => msg.clone(),
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                "内部エラーが発生しました".to_string()
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                "内部エラーが発生しました".to_string()
            }
            Self::ChannelHttp(e) => {
                tracing::error!(error = ?e, "外部チャネル通信エラー");
                "外部チャネルとの通信に失敗しました".to_string()
            }
            Self::Channel(e) => {
                tracing::error!(error = %e, "外部チャネルエラー");
                "外部チャネルとの通信に失敗しました".to_string()
            }
            // 失敗理由（コード不一致・時間ウィンドウ外）は区別しない
            Self::InvalidCode => "認証コードが正しくありません".to_string(),
            // 期限切れ・使用済み・偽造は区別しない
            Self::InvalidToken => "無効なトークンです".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_errors_are_distinct_from_admin_errors() {
        assert_eq!(AppError::InvalidCode.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::MisconfiguredApp.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_ne!(
            AppError::ApprovalTimeout.status_code(),
            AppError::ApprovalDenied.status_code()
        );
    }

    #[test]
    fn test_not_found_message_names_resource() {
        let err = AppError::NotFound("アプリケーション");
        assert!(err.to_string().contains("アプリケーション"));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let response =
            AppError::Internal(anyhow::anyhow!("secret detail")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
