use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// (app_id, user_id) ごとの二要素認証レコード
///
/// user_id は連携元アプリケーションが管理する不透明な文字列
/// TOTPシークレットは AES-256-GCM で暗号化されて保存される
#[derive(Debug, Clone, FromRow)]
pub struct UserAuthRecord {
    pub id: i64,
    pub app_id: String,
    pub user_id: String,
    pub totp_secret_encrypted: Option<Vec<u8>>,
    pub is_totp_enabled: bool,
    pub channel_account_id: Option<String>,
    pub is_channel_enabled: bool,
    pub channel_bind_nonce: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// TOTP 軸の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TotpState {
    Unenrolled,
    PendingTotp,
    TotpActive,
}

/// 外部チャネル軸の状態（TOTP 軸とは独立）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    None,
    PendingChannel,
    ChannelActive,
}

/// 管理者リセットの対象
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetScope {
    #[default]
    All,
    Totp,
    Channel,
}

impl UserAuthRecord {
    pub fn totp_state(&self) -> TotpState {
        match (&self.totp_secret_encrypted, self.is_totp_enabled) {
            (Some(_), true) => TotpState::TotpActive,
            (Some(_), false) => TotpState::PendingTotp,
            (None, _) => TotpState::Unenrolled,
        }
    }

    pub fn channel_state(&self) -> ChannelState {
        if self.is_channel_enabled {
            ChannelState::ChannelActive
        } else if self.channel_bind_nonce.is_some() {
            ChannelState::PendingChannel
        } else {
            ChannelState::None
        }
    }
}
