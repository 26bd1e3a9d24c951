use axum::{Json, extract::State, http::HeaderMap};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::AppError;
use crate::state::AppState;

const APP_ID_HEADER: &str = "x-app-id";
const APP_SECRET_HEADER: &str = "x-app-secret";

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RedeemResponse {
    pub app_id: String,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

/// POST /handoff/redeem
///
/// 連携元アプリケーションのサーバーからハンドオフトークンを引き換える
///
/// # Security
/// - X-App-Id / X-App-Secret で呼び出し元を認証
/// - トークンは1回のみ引き換え可能
pub async fn redeem(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RedeemRequest>,
) -> Result<Json<RedeemResponse>, AppError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)
    };
    let app_id = header(APP_ID_HEADER)?;
    let app_secret = header(APP_SECRET_HEADER)?;

    let claims = state
        .handoff
        .redeem(app_id, app_secret, &request.token)
        .await?;

    let issued_at =
        OffsetDateTime::from_unix_timestamp(claims.iat).map_err(|_| AppError::InvalidToken)?;

    Ok(Json(RedeemResponse {
        app_id: claims.app_id,
        user_id: claims.sub,
        issued_at,
    }))
}
