use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;

/// 2FA ゲートウェイに登録されたアプリケーション
///
/// app_secret は AES-256-GCM で暗号化されて保存される
/// 平文シークレットはログに出力禁止
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub app_id: String,
    #[serde(skip)]
    pub secret_encrypted: Vec<u8>,
    pub callback_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
