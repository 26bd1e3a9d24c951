//! 検証フローの入口
//!
//! 要素の選択（TOTP / プッシュ承認）と、成功後のハンドオフをまとめる。

use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Application, ChannelState, TotpState};
use crate::services::channel::{ApprovalOutcome, ChannelService};
use crate::services::credentials::CredentialService;
use crate::services::enrollment::{EnrollmentService, TotpVerification, validate_user_id};
use crate::services::handoff::HandoffIssuer;

/// 検証に使われた要素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Totp,
    Channel,
}

/// 検証成功
#[derive(Debug, Clone)]
pub struct Verified {
    pub method: VerificationMethod,
    /// この検証で PENDING_TOTP → TOTP_ACTIVE に遷移した
    pub activated: bool,
    /// コールバック未設定の場合は None
    pub redirect_url: Option<String>,
}

/// プッシュ承認のポーリング結果
#[derive(Debug, Clone)]
pub enum ApprovalPoll {
    Pending,
    Approved(Verified),
}

/// (app_id, user_id) の状態サマリー
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub app_id: String,
    pub user_id: String,
    pub totp_state: TotpState,
    pub channel_state: ChannelState,
    pub is_totp_enabled: bool,
    pub is_wechat_enabled: bool,
}

#[derive(Clone)]
pub struct Gateway {
    credentials: CredentialService,
    enrollment: EnrollmentService,
    channel: ChannelService,
    handoff: HandoffIssuer,
}

impl Gateway {
    pub fn new(
        credentials: CredentialService,
        enrollment: EnrollmentService,
        channel: ChannelService,
        handoff: HandoffIssuer,
    ) -> Self {
        Self {
            credentials,
            enrollment,
            channel,
            handoff,
        }
    }

    /// 二要素認証を検証
    ///
    /// - code あり: TOTP で検証
    /// - code なし・チャネル連携済み: プッシュ承認を送信し決定まで待機
    /// - いずれも未設定: NotEnrolled
    pub async fn verify(
        &self,
        app_id: &str,
        user_id: &str,
        code: Option<&str>,
    ) -> Result<Verified, AppError> {
        validate_user_id(user_id)?;
        let application = self.credentials.get_application(app_id).await?;

        if let Some(code) = code {
            let result = self.enrollment.verify_code(app_id, user_id, code).await?;
            tracing::info!(app_id = %app_id, user_id = %user_id, method = "totp", "二要素認証成功");
            return self.complete(
                &application,
                user_id,
                VerificationMethod::Totp,
                result == TotpVerification::Activated,
            );
        }

        let channel_active = self
            .enrollment
            .record(app_id, user_id)
            .await?
            .is_some_and(|r| r.channel_state() == ChannelState::ChannelActive);
        if !channel_active {
            return Err(AppError::NotEnrolled);
        }

        let ticket = self.channel.request_approval(app_id, user_id).await?;
        match self
            .channel
            .await_approval(app_id, user_id, ticket.approval_id)
            .await?
        {
            ApprovalOutcome::Approved => {
                tracing::info!(app_id = %app_id, user_id = %user_id, method = "channel", "二要素認証成功");
                self.complete(&application, user_id, VerificationMethod::Channel, false)
            }
            ApprovalOutcome::Pending => Err(AppError::ApprovalTimeout),
        }
    }

    /// 送信済みプッシュ承認の結果を取得（最大 wait 待機）
    pub async fn poll_approval(
        &self,
        app_id: &str,
        user_id: &str,
        approval_id: Uuid,
        wait: std::time::Duration,
    ) -> Result<ApprovalPoll, AppError> {
        validate_user_id(user_id)?;
        let application = self.credentials.get_application(app_id).await?;

        match self
            .channel
            .poll_approval(app_id, user_id, approval_id, wait)
            .await?
        {
            ApprovalOutcome::Pending => Ok(ApprovalPoll::Pending),
            ApprovalOutcome::Approved => Ok(ApprovalPoll::Approved(self.complete(
                &application,
                user_id,
                VerificationMethod::Channel,
                false,
            )?)),
        }
    }

    pub async fn status(&self, app_id: &str, user_id: &str) -> Result<AuthStatus, AppError> {
        validate_user_id(user_id)?;
        self.credentials.get_application(app_id).await?;

        let record = self.enrollment.record(app_id, user_id).await?;
        let totp_state = record
            .as_ref()
            .map(|r| r.totp_state())
            .unwrap_or(TotpState::Unenrolled);
        let channel_state = record
            .as_ref()
            .map(|r| r.channel_state())
            .unwrap_or(ChannelState::None);

        Ok(AuthStatus {
            app_id: app_id.to_string(),
            user_id: user_id.to_string(),
            totp_state,
            channel_state,
            is_totp_enabled: totp_state == TotpState::TotpActive,
            is_wechat_enabled: channel_state == ChannelState::ChannelActive,
        })
    }

    /// 検証成功後のハンドオフ
    fn complete(
        &self,
        application: &Application,
        user_id: &str,
        method: VerificationMethod,
        activated: bool,
    ) -> Result<Verified, AppError> {
        let redirect_url = match application.callback_url {
            Some(_) => Some(self.handoff.handoff(application, user_id)?.redirect_url),
            None => {
                tracing::debug!(app_id = %application.app_id, "コールバック未設定のためトークン発行なし");
                None
            }
        };

        Ok(Verified {
            method,
            activated,
            redirect_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::OffsetDateTime;

    use super::*;
    use crate::repositories::Stores;
    use crate::services::credentials::NewApplicationInput;
    use crate::services::crypto::SecretCipher;
    use crate::services::handoff::verify_token;
    use crate::services::totp::TotpEngine;

    struct Fixture {
        gateway: Gateway,
        enrollment: EnrollmentService,
        app_id: String,
        app_secret: String,
    }

    async fn fixture(callback_url: Option<&str>) -> Fixture {
        let stores = Stores::in_memory();
        let cipher = SecretCipher::from_key([3u8; 32]);
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
            None,
            cipher,
            "https://gw.example".to_string(),
            time::Duration::seconds(120),
            std::time::Duration::from_secs(5),
        );
        let handoff = HandoffIssuer::new(
            credentials.clone(),
            Arc::clone(&stores.ledger),
            time::Duration::seconds(60),
        );

        let issued = credentials
            .create_application(NewApplicationInput {
                name: "A1".to_string(),
                description: String::new(),
                callback_url: callback_url.map(str::to_string),
            })
            .await
            .unwrap();

        Fixture {
            gateway: Gateway::new(credentials, enrollment.clone(), channel, handoff),
            enrollment,
            app_id: issued.application.app_id,
            app_secret: issued.app_secret,
        }
    }

    fn current_code(secret: &str) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp() as u64;
        TotpEngine::new().code_at(secret, now).unwrap()
    }

    #[tokio::test]
    async fn test_verify_redirects_to_callback_with_token() {
        let f = fixture(Some("https://client.example/cb")).await;
        let setup = f.enrollment.begin_setup(&f.app_id, "U1").await.unwrap();

        let verified = f
            .gateway
            .verify(&f.app_id, "U1", Some(&current_code(&setup.secret)))
            .await
            .unwrap();
        assert_eq!(verified.method, VerificationMethod::Totp);
        assert!(verified.activated);

        let redirect_url = verified.redirect_url.unwrap();
        assert!(redirect_url.starts_with("https://client.example/cb?token="));

        let token = url::Url::parse(&redirect_url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let claims = verify_token(&token, &f.app_secret, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(claims.app_id, f.app_id);
        assert_eq!(claims.sub, "U1");
    }

    #[tokio::test]
    async fn test_verify_without_callback_omits_redirect() {
        let f = fixture(None).await;
        let setup = f.enrollment.begin_setup(&f.app_id, "U1").await.unwrap();

        let verified = f
            .gateway
            .verify(&f.app_id, "U1", Some(&current_code(&setup.secret)))
            .await
            .unwrap();
        assert!(verified.redirect_url.is_none());
    }

    #[tokio::test]
    async fn test_verify_without_any_factor() {
        let f = fixture(None).await;
        assert!(matches!(
            f.gateway.verify(&f.app_id, "U1", None).await,
            Err(AppError::NotEnrolled)
        ));
        assert!(matches!(
            f.gateway.verify(&f.app_id, "U1", Some("123456")).await,
            Err(AppError::NotEnrolled)
        ));
    }

    #[tokio::test]
    async fn test_verify_without_code_requires_channel() {
        let f = fixture(None).await;
        let setup = f.enrollment.begin_setup(&f.app_id, "U1").await.unwrap();
        f.gateway
            .verify(&f.app_id, "U1", Some(&current_code(&setup.secret)))
            .await
            .unwrap();

        // TOTP 有効でもコードなしはチャネル連携が必要
        assert!(matches!(
            f.gateway.verify(&f.app_id, "U1", None).await,
            Err(AppError::NotEnrolled)
        ));
    }

    #[tokio::test]
    async fn test_verify_unknown_app() {
        let f = fixture(None).await;
        assert!(matches!(
            f.gateway.verify("missing", "U1", Some("123456")).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_tracks_totp_axis() {
        let f = fixture(None).await;
        let status = f.gateway.status(&f.app_id, "U1").await.unwrap();
        assert_eq!(status.totp_state, TotpState::Unenrolled);
        assert_eq!(status.channel_state, ChannelState::None);

        let setup = f.enrollment.begin_setup(&f.app_id, "U1").await.unwrap();
        let status = f.gateway.status(&f.app_id, "U1").await.unwrap();
        assert_eq!(status.totp_state, TotpState::PendingTotp);
        assert!(!status.is_totp_enabled);

        f.gateway
            .verify(&f.app_id, "U1", Some(&current_code(&setup.secret)))
            .await
            .unwrap();
        let status = f.gateway.status(&f.app_id, "U1").await.unwrap();
        assert_eq!(status.totp_state, TotpState::TotpActive);
        assert!(status.is_totp_enabled);
    }
}
