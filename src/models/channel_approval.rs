use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    /// 承認済みをハンドオフに使用済み（終端）
    Consumed,
}

/// プッシュ承認リクエスト
///
/// 決定トークンはハッシュ化してDBに保存（token_hash）
/// 平文トークンは外部チャネルのメッセージにのみ含める
#[derive(Debug, Clone, FromRow)]
pub struct ChannelApproval {
    pub id: Uuid,
    pub app_id: String,
    pub user_id: String,
    pub token_hash: String,
    pub status: ApprovalStatus,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub decided_at: Option<OffsetDateTime>,
}

impl ChannelApproval {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}
