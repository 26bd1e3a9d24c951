//! 外部チャネルから直接アクセスされるエンドポイント
//!
//! ユーザーのブラウザ（企業微信内）で開かれるため、結果は簡易 HTML で返す

use axum::{
    extract::{Path, Query, State},
    response::Html,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ApprovalStatus;
use crate::services::channel::Decision;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

/// GET /channel/wecom/callback?code=&state=
///
/// 企業微信の OAuth2 認可後のリダイレクト先
pub async fn wecom_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Html<String>, AppError> {
    state
        .channel
        .handle_callback(&query.code, &query.state)
        .await?;

    Ok(result_page("企業微信の連携が完了しました。元の画面に戻ってください。"))
}

#[derive(Debug, Deserialize)]
pub struct DecisionQuery {
    pub token: String,
    pub decision: Decision,
}

/// GET /channel/approvals/{approval_id}?token=&decision=approve|deny
///
/// プッシュメッセージ内のリンク。トークンは使い捨て
pub async fn decide_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<Uuid>,
    Query(query): Query<DecisionQuery>,
) -> Result<Html<String>, AppError> {
    let status = state
        .channel
        .decide(approval_id, &query.token, query.decision)
        .await?;

    Ok(result_page(match status {
        ApprovalStatus::Approved => "ログインを承認しました。",
        _ => "ログインを拒否しました。",
    }))
}

fn result_page(message: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html lang=\"ja\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">\
         <title>二要素認証</title></head><body><p>{}</p></body></html>",
        message
    ))
}
