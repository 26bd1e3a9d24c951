//! 管理 API: アプリケーションとユーザー

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{Application, ChannelState, ResetScope, TotpState, UserAuthRecord};
use crate::repositories::ApplicationPatch;
use crate::services::credentials::{IssuedCredentials, NewApplicationInput};
use crate::state::AppState;

// === Applications ===

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAppRequest {
    #[garde(length(chars, min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    #[garde(length(chars, max = 1000))]
    pub description: String,
    #[garde(url)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateAppRequest {
    #[garde(length(chars, min = 1, max = 100))]
    pub name: Option<String>,
    #[garde(length(chars, max = 1000))]
    pub description: Option<String>,
    #[garde(url)]
    pub callback_url: Option<String>,
}

/// app_secret を含むレスポンス（作成・開示・ローテーション時のみ）
#[derive(Debug, Serialize)]
pub struct CredentialsResponse {
    #[serde(flatten)]
    pub application: Application,
    pub app_secret: String,
}

impl From<IssuedCredentials> for CredentialsResponse {
    fn from(issued: IssuedCredentials) -> Self {
        Self {
            application: issued.application,
            app_secret: issued.app_secret,
        }
    }
}

/// GET /apps
pub async fn list_apps(State(state): State<AppState>) -> Result<Json<Vec<Application>>, AppError> {
    Ok(Json(state.credentials.list_applications().await?))
}

/// POST /apps
///
/// # Security
/// - app_secret はこのレスポンスでのみ返却（ログ出力禁止）
pub async fn create_app(
    State(state): State<AppState>,
    Json(request): Json<CreateAppRequest>,
) -> Result<(StatusCode, Json<CredentialsResponse>), AppError> {
    request.validate()?;

    let issued = state
        .credentials
        .create_application(NewApplicationInput {
            name: request.name,
            description: request.description,
            callback_url: request.callback_url,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(issued.into())))
}

/// GET /apps/{app_id}
pub async fn get_app(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<Application>, AppError> {
    Ok(Json(state.credentials.get_application(&app_id).await?))
}

/// PUT /apps/{app_id}
pub async fn update_app(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Json(request): Json<UpdateAppRequest>,
) -> Result<Json<Application>, AppError> {
    request.validate()?;

    let application = state
        .credentials
        .update_application(
            &app_id,
            ApplicationPatch {
                name: request.name,
                description: request.description,
                callback_url: request.callback_url,
            },
        )
        .await?;

    Ok(Json(application))
}

/// POST /apps/{app_id}/secret
pub async fn reveal_secret(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<CredentialsResponse>, AppError> {
    Ok(Json(state.credentials.reveal_secret(&app_id).await?.into()))
}

/// POST /apps/{app_id}/secret/rotate
pub async fn rotate_secret(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<CredentialsResponse>, AppError> {
    Ok(Json(state.credentials.rotate_secret(&app_id).await?.into()))
}

// === Users ===

#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub totp_state: TotpState,
    pub channel_state: ChannelState,
    pub is_totp_enabled: bool,
    pub is_wechat_enabled: bool,
    pub wechat_id: Option<String>,
}

impl From<UserAuthRecord> for UserSummary {
    fn from(record: UserAuthRecord) -> Self {
        Self {
            totp_state: record.totp_state(),
            channel_state: record.channel_state(),
            is_totp_enabled: record.is_totp_enabled,
            is_wechat_enabled: record.is_channel_enabled,
            wechat_id: record.channel_account_id,
            user_id: record.user_id,
        }
    }
}

/// GET /apps/{app_id}/users
pub async fn list_users(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<Vec<UserSummary>>, AppError> {
    let users = state.enrollment.list_users(&app_id).await?;
    Ok(Json(users.into_iter().map(UserSummary::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct ResetQuery {
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub factor: ResetScope,
}

/// DELETE /apps/{app_id}/users/{user_id}?confirm=true[&factor=all|totp|channel]
///
/// 二要素認証のリセット（ユーザーは次回セットアップからやり直し）
pub async fn reset_user(
    State(state): State<AppState>,
    Path((app_id, user_id)): Path<(String, String)>,
    Query(query): Query<ResetQuery>,
) -> Result<Json<UserSummary>, AppError> {
    if !query.confirm {
        return Err(AppError::Validation(
            "リセットには confirm=true の指定が必要です".to_string(),
        ));
    }

    let record = state
        .enrollment
        .reset(&app_id, &user_id, query.factor)
        .await?;

    Ok(Json(record.into()))
}
