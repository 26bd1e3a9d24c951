//! 外部チャネル（企業メッセージング）連携とプッシュ承認
//!
//! バインド: beginBind → 外部チャネルの認可画面 → コールバック → completeBind
//! 承認: requestApproval → プッシュメッセージの承認/拒否リンク → decide → pollApproval

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Application, ApprovalStatus, ChannelApproval, UserAuthRecord};
use crate::repositories::{ApprovalStore, NewApproval, UserAuthStore};
use crate::services::credentials::CredentialService;
use crate::services::crypto::{SecretCipher, hash_token, random_token};
use crate::services::enrollment::validate_user_id;

/// バインド state の有効期間
const BIND_STATE_TTL_SECS: i64 = 600;
const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// プッシュ承認メッセージの内容
#[derive(Debug, Clone)]
pub struct ApprovalPrompt {
    pub app_name: String,
    pub user_id: String,
    pub approve_url: String,
    pub deny_url: String,
    pub expires_at: OffsetDateTime,
}

/// 外部チャネルとの具体的な連携
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// 外部チャネルの認可URL（バインド開始時のリダイレクト先）
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<String, AppError>;

    /// コールバックで受け取った code を外部アカウントIDに解決
    async fn resolve_account(&self, code: &str) -> Result<String, AppError>;

    /// 承認リクエストをプッシュ送信
    async fn send_approval_prompt(
        &self,
        account_id: &str,
        prompt: &ApprovalPrompt,
    ) -> Result<(), AppError>;
}

/// バインド要求（呼び出し元はユーザーを authorize_url へ遷移させる）
#[derive(Debug, Clone)]
pub struct BindingHandle {
    pub authorize_url: String,
}

/// 発行済み承認リクエスト
#[derive(Debug, Clone)]
pub struct ApprovalTicket {
    pub approval_id: Uuid,
    pub expires_at: OffsetDateTime,
}

/// 承認待ちの結果（拒否・タイムアウトはエラー）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Pending,
    Approved,
}

/// 承認/拒否
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Deny,
}

/// state に封印するバインド文脈
#[derive(Debug, Serialize, Deserialize)]
struct BindState {
    app_id: String,
    user_id: String,
    nonce: String,
    iat: i64,
}

#[derive(Clone)]
pub struct ChannelService {
    records: Arc<dyn UserAuthStore>,
    approvals: Arc<dyn ApprovalStore>,
    credentials: CredentialService,
    provider: Option<Arc<dyn ChannelProvider>>,
    cipher: SecretCipher,
    public_base_url: String,
    approval_timeout: Duration,
    max_wait: std::time::Duration,
    poll_interval: std::time::Duration,
}

impl ChannelService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        records: Arc<dyn UserAuthStore>,
        approvals: Arc<dyn ApprovalStore>,
        credentials: CredentialService,
        provider: Option<Arc<dyn ChannelProvider>>,
        cipher: SecretCipher,
        public_base_url: String,
        approval_timeout: Duration,
        max_wait: std::time::Duration,
    ) -> Self {
        Self {
            records,
            approvals,
            credentials,
            provider,
            cipher,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            approval_timeout,
            max_wait,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: std::time::Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// 外部チャネルのコールバックURL
    pub fn callback_url(&self) -> String {
        format!("{}/channel/wecom/callback", self.public_base_url)
    }

    /// バインドを開始（PENDING_CHANNEL を作成または更新）
    pub async fn begin_bind(&self, app_id: &str, user_id: &str) -> Result<BindingHandle, AppError> {
        validate_user_id(user_id)?;
        let provider = self.provider()?;
        self.credentials.get_application(app_id).await?;

        let nonce = random_token(16);
        self.records
            .begin_channel_bind(app_id, user_id, &nonce)
            .await?;

        let state = BindState {
            app_id: app_id.to_string(),
            user_id: user_id.to_string(),
            nonce,
            iat: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let sealed = self
            .cipher
            .seal(&serde_json::to_string(&state).map_err(|e| AppError::Internal(e.into()))?)?;

        let authorize_url = provider.authorize_url(&self.callback_url(), &sealed)?;

        tracing::info!(app_id = %app_id, user_id = %user_id, "チャネルバインド開始");

        Ok(BindingHandle { authorize_url })
    }

    /// 外部チャネルからのコールバックを処理
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<UserAuthRecord, AppError> {
        let provider = self.provider()?;

        let state: BindState = serde_json::from_str(&self.cipher.unseal(state)?)
            .map_err(|_| AppError::InvalidToken)?;
        let age = OffsetDateTime::now_utc().unix_timestamp() - state.iat;
        if !(0..=BIND_STATE_TTL_SECS).contains(&age) {
            tracing::warn!(app_id = %state.app_id, user_id = %state.user_id, "期限切れのバインド state");
            return Err(AppError::InvalidToken);
        }

        let account_id = provider.resolve_account(code).await?;

        self.complete_bind(&state.app_id, &state.user_id, &state.nonce, &account_id)
            .await
    }

    /// バインドを確定（PENDING_CHANNEL → CHANNEL_ACTIVE）
    ///
    /// 別アカウントが確定済みの場合は Conflict（管理者リセットが必要）
    pub async fn complete_bind(
        &self,
        app_id: &str,
        user_id: &str,
        nonce: &str,
        account_id: &str,
    ) -> Result<UserAuthRecord, AppError> {
        if self
            .records
            .complete_channel_bind(app_id, user_id, nonce, account_id)
            .await?
        {
            tracing::info!(app_id = %app_id, user_id = %user_id, "チャネルバインド完了");
            return self
                .records
                .find(app_id, user_id)
                .await?
                .ok_or(AppError::NotFound("ユーザー"));
        }

        let record = self
            .records
            .find(app_id, user_id)
            .await?
            .ok_or(AppError::NotFound("ユーザー"))?;

        if record.is_channel_enabled && record.channel_account_id.as_deref() != Some(account_id) {
            tracing::warn!(app_id = %app_id, user_id = %user_id, "別アカウントが連携済み");
            return Err(AppError::Conflict(
                "別のアカウントが既に連携されています（管理者によるリセットが必要です）"
                    .to_string(),
            ));
        }

        tracing::warn!(app_id = %app_id, user_id = %user_id, "バインド nonce 不一致（使用済みまたは再発行済み）");
        Err(AppError::InvalidToken)
    }

    /// プッシュ承認を要求
    pub async fn request_approval(
        &self,
        app_id: &str,
        user_id: &str,
    ) -> Result<ApprovalTicket, AppError> {
        validate_user_id(user_id)?;
        let provider = self.provider()?;
        let application = self.credentials.get_application(app_id).await?;
        let account_id = self.bound_account(app_id, user_id).await?;

        let token = random_token(32);
        let approval = self
            .approvals
            .create(NewApproval {
                id: Uuid::new_v4(),
                app_id: app_id.to_string(),
                user_id: user_id.to_string(),
                token_hash: hash_token(&token),
                expires_at: OffsetDateTime::now_utc() + self.approval_timeout,
            })
            .await?;

        let prompt = self.prompt(&application, user_id, &approval, &token);
        provider.send_approval_prompt(&account_id, &prompt).await?;

        tracing::info!(app_id = %app_id, user_id = %user_id, approval_id = %approval.id, "プッシュ承認送信");

        Ok(ApprovalTicket {
            approval_id: approval.id,
            expires_at: approval.expires_at,
        })
    }

    /// 承認結果をロングポーリング
    ///
    /// 最大 `wait`（上限 max_wait）待機し、未決定なら Pending を返す。
    pub async fn poll_approval(
        &self,
        app_id: &str,
        user_id: &str,
        approval_id: Uuid,
        wait: std::time::Duration,
    ) -> Result<ApprovalOutcome, AppError> {
        self.wait_for_decision(app_id, user_id, approval_id, Some(wait.min(self.max_wait)))
            .await
    }

    /// 決定または期限切れまで待機
    pub async fn await_approval(
        &self,
        app_id: &str,
        user_id: &str,
        approval_id: Uuid,
    ) -> Result<ApprovalOutcome, AppError> {
        self.wait_for_decision(app_id, user_id, approval_id, None)
            .await
    }

    /// プッシュメッセージのリンクからの承認/拒否
    ///
    /// トークンは使い捨て。期限切れ・使用済み・不一致は InvalidToken
    pub async fn decide(
        &self,
        approval_id: Uuid,
        token: &str,
        decision: Decision,
    ) -> Result<ApprovalStatus, AppError> {
        let status = match decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Deny => ApprovalStatus::Denied,
        };

        if self
            .approvals
            .decide(approval_id, &hash_token(token), status)
            .await?
        {
            tracing::info!(approval_id = %approval_id, status = ?status, "プッシュ承認決定");
            return Ok(status);
        }

        if self.approvals.find(approval_id).await?.is_none() {
            return Err(AppError::NotFound("承認リクエスト"));
        }
        tracing::warn!(approval_id = %approval_id, "無効な承認トークン");
        Err(AppError::InvalidToken)
    }

    /// 待機ループ
    ///
    /// tokio のタイマーで待機するため、ワーカースレッドを塞がない。
    /// HTTP リクエストが中断されると future ごと破棄される。
    async fn wait_for_decision(
        &self,
        app_id: &str,
        user_id: &str,
        approval_id: Uuid,
        wait: Option<std::time::Duration>,
    ) -> Result<ApprovalOutcome, AppError> {
        let deadline = wait.map(|w| tokio::time::Instant::now() + w);

        loop {
            let approval = self.approval_for(app_id, user_id, approval_id).await?;
            match approval.status {
                ApprovalStatus::Approved => {
                    return self.consume_approval(app_id, user_id, approval_id).await;
                }
                ApprovalStatus::Denied => return Err(AppError::ApprovalDenied),
                ApprovalStatus::Consumed => {
                    tracing::warn!(approval_id = %approval_id, "使用済みのプッシュ承認");
                    return Err(AppError::InvalidToken);
                }
                ApprovalStatus::Pending if approval.is_expired_at(OffsetDateTime::now_utc()) => {
                    tracing::info!(approval_id = %approval_id, "プッシュ承認タイムアウト");
                    return Err(AppError::ApprovalTimeout);
                }
                ApprovalStatus::Pending => {}
            }

            let mut sleep_for = self.poll_interval;
            if let Some(deadline) = deadline {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(ApprovalOutcome::Pending);
                }
                sleep_for = sleep_for.min(deadline - now);
            }
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// 承認を使用済みにして Approved を返す
    ///
    /// 承認後にチャネル連携がリセットされていれば無効。
    /// 同時ポーリングでは1件だけが成功する。
    async fn consume_approval(
        &self,
        app_id: &str,
        user_id: &str,
        approval_id: Uuid,
    ) -> Result<ApprovalOutcome, AppError> {
        self.bound_account(app_id, user_id).await?;

        if !self.approvals.consume(approval_id, app_id, user_id).await? {
            tracing::warn!(approval_id = %approval_id, "プッシュ承認は使用済みまたは期限切れ");
            return Err(AppError::InvalidToken);
        }

        Ok(ApprovalOutcome::Approved)
    }

    /// (app_id, user_id) に属する承認のみ返す
    async fn approval_for(
        &self,
        app_id: &str,
        user_id: &str,
        approval_id: Uuid,
    ) -> Result<ChannelApproval, AppError> {
        self.approvals
            .find(approval_id)
            .await?
            .filter(|a| a.app_id == app_id && a.user_id == user_id)
            .ok_or(AppError::NotFound("承認リクエスト"))
    }

    async fn bound_account(&self, app_id: &str, user_id: &str) -> Result<String, AppError> {
        self.records
            .find(app_id, user_id)
            .await?
            .filter(|r| r.is_channel_enabled)
            .and_then(|r| r.channel_account_id)
            .ok_or(AppError::NotEnrolled)
    }

    fn prompt(
        &self,
        application: &Application,
        user_id: &str,
        approval: &ChannelApproval,
        token: &str,
    ) -> ApprovalPrompt {
        let link = |decision: &str| {
            format!(
                "{}/channel/approvals/{}?token={}&decision={}",
                self.public_base_url, approval.id, token, decision
            )
        };

        ApprovalPrompt {
            app_name: application.name.clone(),
            user_id: user_id.to_string(),
            approve_url: link("approve"),
            deny_url: link("deny"),
            expires_at: approval.expires_at,
        }
    }

    fn provider(&self) -> Result<&Arc<dyn ChannelProvider>, AppError> {
        self.provider.as_ref().ok_or(AppError::ChannelUnavailable)
    }
}
