use std::sync::Arc;

use secrecy::ExposeSecret;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::Stores;
use crate::services::{
    ChannelProvider, ChannelService, CredentialService, EnrollmentService, Gateway, HandoffIssuer,
    SecretCipher, TotpEngine,
};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// 資格情報ストア
    pub credentials: CredentialService,
    /// TOTP 登録・検証
    pub enrollment: EnrollmentService,
    /// 外部チャネル連携・プッシュ承認
    pub channel: ChannelService,
    /// ハンドオフトークン
    pub handoff: HandoffIssuer,
    /// 検証フロー
    pub gateway: Gateway,
    /// 定期削除用
    pub stores: Stores,
}

impl AppState {
    /// 新しい AppState を作成
    ///
    /// `provider` が None の場合、チャネル連携系の操作は ChannelUnavailable を返す
    ///
    /// # Errors
    /// - ADMIN_TOKEN が空（空白のみを含む）
    /// - ENCRYPTION_KEY が不正
    pub fn new(
        stores: Stores,
        config: Config,
        provider: Option<Arc<dyn ChannelProvider>>,
    ) -> Result<Self, AppError> {
        // 空の管理トークンでは管理 API を保護できない
        if config.admin_token.expose_secret().trim().is_empty() {
            tracing::error!("ADMIN_TOKEN が空");
            return Err(AppError::Internal(anyhow::anyhow!(
                "admin token must not be empty"
            )));
        }

        let config = Arc::new(config);
        let cipher = SecretCipher::from_base64(config.encryption_key.expose_secret())?;

        let credentials = CredentialService::new(stores.applications.clone(), cipher.clone());
        let enrollment = EnrollmentService::new(
            stores.records.clone(),
            credentials.clone(),
            TotpEngine::new(),
            cipher.clone(),
        );
        let channel = ChannelService::new(
            stores.records.clone(),
            stores.approvals.clone(),
            credentials.clone(),
            provider,
            cipher,
            config.public_base_url.clone(),
            time::Duration::seconds(config.approval_timeout_secs),
            std::time::Duration::from_secs(config.approval_max_wait_secs),
        );
        let handoff = HandoffIssuer::new(
            credentials.clone(),
            stores.ledger.clone(),
            time::Duration::seconds(config.handoff_token_ttl_secs),
        );
        let gateway = Gateway::new(
            credentials.clone(),
            enrollment.clone(),
            channel.clone(),
            handoff.clone(),
        );

        Ok(Self {
            config,
            credentials,
            enrollment,
            channel,
            handoff,
            gateway,
            stores,
        })
    }

    /// 期限切れのプッシュ承認・使用済みトークン台帳を削除
    pub async fn purge_expired(&self) -> Result<(u64, u64), AppError> {
        let approvals = self.stores.approvals.delete_expired().await?;
        let redemptions = self.stores.ledger.delete_expired().await?;
        Ok((approvals, redemptions))
    }
}
