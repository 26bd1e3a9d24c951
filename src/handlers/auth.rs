//! 連携元アプリケーションから遷移してくるユーザー向けの登録・検証 API
//!
//! app_id / user_id はパスパラメータで明示的に受け取る

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::services::gateway::{ApprovalPoll, AuthStatus, VerificationMethod, Verified};
use crate::state::AppState;

// === Status ===

/// GET /auth/status/{app_id}/{user_id}
pub async fn auth_status(
    State(state): State<AppState>,
    Path((app_id, user_id)): Path<(String, String)>,
) -> Result<Json<AuthStatus>, AppError> {
    Ok(Json(state.gateway.status(&app_id, &user_id).await?))
}

// === TOTP Setup ===

#[derive(Debug, Serialize)]
pub struct SetupResponse {
    pub qr_code: String,
    pub secret: String,
    pub otpauth_url: String,
}

/// POST /auth/setup/{app_id}/{user_id}
///
/// TOTP 設定を開始（シークレット生成、QRコード返却）
///
/// # Security
/// - シークレット平文はログ出力禁止
pub async fn setup(
    State(state): State<AppState>,
    Path((app_id, user_id)): Path<(String, String)>,
) -> Result<Json<SetupResponse>, AppError> {
    let outcome = state.enrollment.begin_setup(&app_id, &user_id).await?;

    Ok(Json(SetupResponse {
        qr_code: format!("data:image/png;base64,{}", outcome.qr_code),
        secret: outcome.secret,
        otpauth_url: outcome.otpauth_url,
    }))
}

// === Verify ===

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    /// 省略時はプッシュ承認
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub status: &'static str,
    pub method: VerificationMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

impl From<Verified> for VerifyResponse {
    fn from(verified: Verified) -> Self {
        Self {
            status: "success",
            method: verified.method,
            redirect_url: verified.redirect_url,
        }
    }
}

/// POST /auth/verify/{app_id}/{user_id}
///
/// 二要素認証を検証し、成功時は連携元へのリダイレクトURLを返す
///
/// # Security
/// - コードはログ出力禁止
pub async fn verify(
    State(state): State<AppState>,
    Path((app_id, user_id)): Path<(String, String)>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, AppError> {
    // 形式不正のコードも不一致として扱う（InvalidCode）
    let code = request.code.as_deref().map(str::trim);
    let verified = state.gateway.verify(&app_id, &user_id, code).await?;

    Ok(Json(verified.into()))
}

// === WeCom Binding ===

#[derive(Debug, Serialize)]
pub struct BindResponse {
    pub authorize_url: String,
}

/// POST /auth/bind-wechat/{app_id}/{user_id}
pub async fn bind_wechat(
    State(state): State<AppState>,
    Path((app_id, user_id)): Path<(String, String)>,
) -> Result<Json<BindResponse>, AppError> {
    let handle = state.channel.begin_bind(&app_id, &user_id).await?;

    Ok(Json(BindResponse {
        authorize_url: handle.authorize_url,
    }))
}

// === Push Approval ===

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub approval_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// POST /auth/approval/{app_id}/{user_id}
///
/// プッシュ承認を送信（結果は GET でポーリング）
pub async fn request_approval(
    State(state): State<AppState>,
    Path((app_id, user_id)): Path<(String, String)>,
) -> Result<Json<ApprovalResponse>, AppError> {
    let ticket = state.channel.request_approval(&app_id, &user_id).await?;

    Ok(Json(ApprovalResponse {
        approval_id: ticket.approval_id,
        expires_at: ticket.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// 最大待機秒数（省略時は即時応答）
    #[serde(default)]
    pub wait: u64,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// GET /auth/approval/{app_id}/{user_id}/{approval_id}?wait=
///
/// 拒否は 403、タイムアウトは 408
pub async fn poll_approval(
    State(state): State<AppState>,
    Path((app_id, user_id, approval_id)): Path<(String, String, Uuid)>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, AppError> {
    let poll = state
        .gateway
        .poll_approval(
            &app_id,
            &user_id,
            approval_id,
            std::time::Duration::from_secs(query.wait),
        )
        .await?;

    Ok(Json(match poll {
        ApprovalPoll::Pending => PollResponse {
            status: "pending",
            redirect_url: None,
        },
        ApprovalPoll::Approved(verified) => PollResponse {
            status: "approved",
            redirect_url: verified.redirect_url,
        },
    }))
}
