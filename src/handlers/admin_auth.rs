use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;

use crate::error::AppError;
use crate::services::crypto::constant_time_eq;
use crate::state::AppState;

/// 管理 API の認証ミドルウェア
///
/// `Authorization: Bearer <ADMIN_TOKEN>` を要求する
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if constant_time_eq(token, state.config.admin_token.expose_secret()) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!(path = %request.uri().path(), "管理 API 認証失敗");
            Err(AppError::Unauthorized)
        }
    }
}
