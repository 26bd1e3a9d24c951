//! 永続化レイヤー
//!
//! サービスはトレイト越しにストアへアクセスする。
//! 本番は PostgreSQL 実装、開発・テストはインメモリ実装を使う。

pub mod application;
pub mod approval;
pub mod handoff;
pub mod memory;
pub mod user_auth;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{Application, ApprovalStatus, ChannelApproval, ResetScope, UserAuthRecord};

pub use application::PgApplicationStore;
pub use approval::PgApprovalStore;
pub use handoff::PgHandoffLedger;
pub use memory::{
    InMemoryApplicationStore, InMemoryApprovalStore, InMemoryHandoffLedger, InMemoryUserAuthStore,
};
pub use user_auth::PgUserAuthStore;

/// 新規アプリケーション
#[derive(Debug, Clone)]
pub struct NewApplication {
    pub name: String,
    pub description: String,
    pub app_id: String,
    pub secret_encrypted: Vec<u8>,
    pub callback_url: Option<String>,
}

/// アプリケーションの可変フィールド（None は変更なし）
#[derive(Debug, Clone, Default)]
pub struct ApplicationPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub callback_url: Option<String>,
}

/// 新規プッシュ承認
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub id: Uuid,
    pub app_id: String,
    pub user_id: String,
    pub token_hash: String,
    pub expires_at: OffsetDateTime,
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn insert(&self, new: NewApplication) -> Result<Application, sqlx::Error>;

    async fn find_by_app_id(&self, app_id: &str) -> Result<Option<Application>, sqlx::Error>;

    async fn list(&self) -> Result<Vec<Application>, sqlx::Error>;

    /// 可変フィールドのみ更新。app_id / secret は変更しない
    async fn update(
        &self,
        app_id: &str,
        patch: &ApplicationPatch,
    ) -> Result<Option<Application>, sqlx::Error>;

    /// app_secret のローテーション
    async fn update_secret(
        &self,
        app_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<Option<Application>, sqlx::Error>;
}

/// UserAuthRecord ストア
///
/// 状態遷移を伴う更新はすべて単一の条件付き書き込み（compare-and-set）として実装する。
/// 同一 (app_id, user_id) への同時リクエストが中間状態を残さないこと。
#[async_trait]
pub trait UserAuthStore: Send + Sync {
    async fn find(&self, app_id: &str, user_id: &str)
    -> Result<Option<UserAuthRecord>, sqlx::Error>;

    async fn list_by_app(&self, app_id: &str) -> Result<Vec<UserAuthRecord>, sqlx::Error>;

    /// 未確定シークレットを保存（レコードが無ければ作成）
    ///
    /// # Returns
    /// 確定済みシークレットが既に存在する場合は None（上書きしない）
    async fn store_pending_secret(
        &self,
        app_id: &str,
        user_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<Option<UserAuthRecord>, sqlx::Error>;

    /// 未確定シークレットを確定
    ///
    /// 保存中のシークレットが `secret_encrypted` と一致し、かつ未確定の場合のみ更新する。
    ///
    /// # Returns
    /// この呼び出しで遷移が行われた場合 true
    async fn confirm_totp(
        &self,
        app_id: &str,
        user_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<bool, sqlx::Error>;

    /// チャネルバインドを開始（nonce を更新、レコードが無ければ作成）
    async fn begin_channel_bind(
        &self,
        app_id: &str,
        user_id: &str,
        nonce: &str,
    ) -> Result<UserAuthRecord, sqlx::Error>;

    /// チャネルバインドを確定
    ///
    /// nonce が一致し、かつ未確定または同一アカウントの場合のみ更新する。
    async fn complete_channel_bind(
        &self,
        app_id: &str,
        user_id: &str,
        nonce: &str,
        account_id: &str,
    ) -> Result<bool, sqlx::Error>;

    /// 管理者リセット（レコード自体は残す）
    async fn reset(
        &self,
        app_id: &str,
        user_id: &str,
        scope: ResetScope,
    ) -> Result<Option<UserAuthRecord>, sqlx::Error>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, new: NewApproval) -> Result<ChannelApproval, sqlx::Error>;

    async fn find(&self, id: Uuid) -> Result<Option<ChannelApproval>, sqlx::Error>;

    /// pending・期限内・トークンハッシュ一致の場合のみ決定
    async fn decide(
        &self,
        id: Uuid,
        token_hash: &str,
        status: ApprovalStatus,
    ) -> Result<bool, sqlx::Error>;

    /// 承認済みを使用済みにする（1つの承認から1回だけ検証成功）
    ///
    /// # Returns
    /// この呼び出しで approved → consumed に遷移した場合 true
    async fn consume(&self, id: Uuid, app_id: &str, user_id: &str) -> Result<bool, sqlx::Error>;

    /// 期限切れの承認を削除
    async fn delete_expired(&self) -> Result<u64, sqlx::Error>;
}

/// ハンドオフトークンの使用済み台帳
#[async_trait]
pub trait HandoffLedger: Send + Sync {
    /// jti を消費
    ///
    /// # Returns
    /// 初回消費の場合 true
    async fn consume(
        &self,
        jti: &str,
        app_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error>;

    /// 有効期限を過ぎたエントリを削除
    async fn delete_expired(&self) -> Result<u64, sqlx::Error>;
}

/// 全ストアの束
#[derive(Clone)]
pub struct Stores {
    pub applications: Arc<dyn ApplicationStore>,
    pub records: Arc<dyn UserAuthStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub ledger: Arc<dyn HandoffLedger>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            applications: Arc::new(PgApplicationStore::new(pool.clone())),
            records: Arc::new(PgUserAuthStore::new(pool.clone())),
            approvals: Arc::new(PgApprovalStore::new(pool.clone())),
            ledger: Arc::new(PgHandoffLedger::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            applications: Arc::new(InMemoryApplicationStore::default()),
            records: Arc::new(InMemoryUserAuthStore::default()),
            approvals: Arc::new(InMemoryApprovalStore::default()),
            ledger: Arc::new(InMemoryHandoffLedger::default()),
        }
    }
}
