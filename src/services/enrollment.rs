use std::sync::Arc;

use crate::error::AppError;
use crate::models::{ResetScope, TotpState, UserAuthRecord};
use crate::repositories::UserAuthStore;
use crate::services::credentials::CredentialService;
use crate::services::crypto::SecretCipher;
use crate::services::totp::TotpEngine;

const MAX_USER_ID_LEN: usize = 255;

/// セットアップ結果
#[derive(Debug, Clone)]
pub struct SetupOutcome {
    pub secret: String,
    pub otpauth_url: String,
    pub qr_code: String,
}

/// TOTP 検証結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotpVerification {
    /// PENDING_TOTP → TOTP_ACTIVE の遷移を行った
    Activated,
    /// 確定済みシークレットで検証（状態変化なし）
    Verified,
}

/// (app_id, user_id) ごとの登録・検証ステートマシン（TOTP 軸）
///
/// # Security
/// - シークレット平文・コードはログに出力しない
#[derive(Clone)]
pub struct EnrollmentService {
    records: Arc<dyn UserAuthStore>,
    credentials: CredentialService,
    totp: TotpEngine,
    cipher: SecretCipher,
}

impl EnrollmentService {
    pub fn new(
        records: Arc<dyn UserAuthStore>,
        credentials: CredentialService,
        totp: TotpEngine,
        cipher: SecretCipher,
    ) -> Self {
        Self {
            records,
            credentials,
            totp,
            cipher,
        }
    }

    /// TOTP セットアップを開始
    ///
    /// UNENROLLED / PENDING_TOTP → PENDING_TOTP（呼び出しごとに新しいシークレット）。
    /// 確定済みの場合は管理者リセットが必要。
    pub async fn begin_setup(&self, app_id: &str, user_id: &str) -> Result<SetupOutcome, AppError> {
        validate_user_id(user_id)?;
        let application = self.credentials.get_application(app_id).await?;

        let secret = TotpEngine::generate_secret();
        let encrypted = self.cipher.encrypt_str(&secret)?;

        if self
            .records
            .store_pending_secret(app_id, user_id, &encrypted)
            .await?
            .is_none()
        {
            tracing::warn!(app_id = %app_id, user_id = %user_id, "TOTP確定済みのためセットアップ拒否");
            return Err(AppError::Conflict(
                "二要素認証は既に有効です（管理者によるリセットが必要です）".to_string(),
            ));
        }

        let provisioning = self
            .totp
            .provisioning(&application.name, user_id, &secret)?;

        tracing::info!(app_id = %app_id, user_id = %user_id, "TOTPセットアップ開始");

        Ok(SetupOutcome {
            secret,
            otpauth_url: provisioning.otpauth_url,
            qr_code: provisioning.qr_code,
        })
    }

    /// TOTP コードを検証
    ///
    /// 確定済みシークレットがあればそれを、なければ未確定シークレットを使う。
    /// 未確定シークレットでの初回成功時に確定（is_totp_enabled = true）。
    /// 失敗時は未確定シークレットを保持する（QR の再スキャン不要）。
    pub async fn verify_code(
        &self,
        app_id: &str,
        user_id: &str,
        code: &str,
    ) -> Result<TotpVerification, AppError> {
        validate_user_id(user_id)?;

        let record = self
            .records
            .find(app_id, user_id)
            .await?
            .ok_or(AppError::NotEnrolled)?;
        let encrypted = record
            .totp_secret_encrypted
            .clone()
            .ok_or(AppError::NotEnrolled)?;

        let secret = self.cipher.decrypt_to_string(&encrypted)?;
        if !self.totp.verify_code(&secret, code)? {
            tracing::warn!(app_id = %app_id, user_id = %user_id, "TOTPコード不一致");
            return Err(AppError::InvalidCode);
        }

        if record.is_totp_enabled {
            return Ok(TotpVerification::Verified);
        }

        if self
            .records
            .confirm_totp(app_id, user_id, &encrypted)
            .await?
        {
            tracing::info!(app_id = %app_id, user_id = %user_id, "TOTP有効化完了");
            return Ok(TotpVerification::Activated);
        }

        // 同時リクエストとの競合: 再読込して結果を判定
        let current = self.records.find(app_id, user_id).await?;
        match current {
            Some(r) if r.is_totp_enabled && r.totp_secret_encrypted.as_deref() == Some(&encrypted[..]) => {
                Ok(TotpVerification::Verified)
            }
            _ => {
                // 検証中にシークレットが差し替えられた、またはリセットされた
                tracing::warn!(app_id = %app_id, user_id = %user_id, "検証中にTOTPシークレットが変更された");
                Err(AppError::InvalidCode)
            }
        }
    }

    /// 現在のレコード（未作成なら None）
    pub async fn record(&self, app_id: &str, user_id: &str) -> Result<Option<UserAuthRecord>, AppError> {
        validate_user_id(user_id)?;
        Ok(self.records.find(app_id, user_id).await?)
    }

    /// TOTP 軸の状態
    pub async fn totp_state(&self, app_id: &str, user_id: &str) -> Result<TotpState, AppError> {
        Ok(self
            .record(app_id, user_id)
            .await?
            .map(|r| r.totp_state())
            .unwrap_or(TotpState::Unenrolled))
    }

    /// アプリケーション配下のユーザー一覧
    pub async fn list_users(&self, app_id: &str) -> Result<Vec<UserAuthRecord>, AppError> {
        self.credentials.get_application(app_id).await?;
        Ok(self.records.list_by_app(app_id).await?)
    }

    /// 管理者リセット
    ///
    /// TOTP_ACTIVE → UNENROLLED（scope に応じてチャネル連携も解除）。
    /// レコード自体は監査用に残す。
    pub async fn reset(
        &self,
        app_id: &str,
        user_id: &str,
        scope: ResetScope,
    ) -> Result<UserAuthRecord, AppError> {
        validate_user_id(user_id)?;
        self.credentials.get_application(app_id).await?;

        let record = self
            .records
            .reset(app_id, user_id, scope)
            .await?
            .ok_or(AppError::NotFound("ユーザー"))?;

        tracing::info!(app_id = %app_id, user_id = %user_id, scope = ?scope, "二要素認証リセット");

        Ok(record)
    }
}

/// user_id バリデーション（連携元が管理する不透明な文字列）
pub fn validate_user_id(user_id: &str) -> Result<(), AppError> {
    if user_id.is_empty() {
        return Err(AppError::Validation("user_id は必須です".to_string()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(AppError::Validation(format!(
            "user_id は{}バイト以内で指定してください",
            MAX_USER_ID_LEN
        )));
    }
    if user_id.chars().any(char::is_control) {
        return Err(AppError::Validation(
            "user_id に制御文字は使用できません".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{InMemoryApplicationStore, InMemoryUserAuthStore};
    use crate::services::credentials::NewApplicationInput;

    struct Fixture {
        service: EnrollmentService,
        app_id: String,
    }

    async fn fixture() -> Fixture {
        let cipher = SecretCipher::from_key([4u8; 32]);
        let credentials = CredentialService::new(
            Arc::new(InMemoryApplicationStore::default()),
            cipher.clone(),
        );
        let app_id = credentials
            .create_application(NewApplicationInput {
                name: "Client".to_string(),
                description: String::new(),
                callback_url: Some("https://client.example/cb".to_string()),
            })
            .await
            .unwrap()
            .application
            .app_id;

        Fixture {
            service: EnrollmentService::new(
                Arc::new(InMemoryUserAuthStore::default()),
                credentials,
                TotpEngine::new(),
                cipher,
            ),
            app_id,
        }
    }

    fn current_code(secret: &str) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        TotpEngine::new().code_at(secret, now).unwrap()
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id(&"x".repeat(256)).is_err());
        assert!(validate_user_id("user\n1").is_err());
        assert!(validate_user_id("user@example.com").is_ok());
    }

    #[tokio::test]
    async fn test_setup_unknown_app() {
        let f = fixture().await;
        let result = f.service.begin_setup("missing", "U1").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_verify_without_setup_is_not_enrolled() {
        let f = fixture().await;
        let result = f.service.verify_code(&f.app_id, "U1", "123456").await;
        assert!(matches!(result, Err(AppError::NotEnrolled)));
    }

    #[tokio::test]
    async fn test_setup_verify_round_trip() {
        let f = fixture().await;
        let setup = f.service.begin_setup(&f.app_id, "U1").await.unwrap();
        assert_eq!(
            f.service.totp_state(&f.app_id, "U1").await.unwrap(),
            TotpState::PendingTotp
        );

        let code = current_code(&setup.secret);
        assert_eq!(
            f.service.verify_code(&f.app_id, "U1", &code).await.unwrap(),
            TotpVerification::Activated
        );
        assert_eq!(
            f.service.verify_code(&f.app_id, "U1", &code).await.unwrap(),
            TotpVerification::Verified
        );
        assert_eq!(
            f.service.totp_state(&f.app_id, "U1").await.unwrap(),
            TotpState::TotpActive
        );
    }

    #[tokio::test]
    async fn test_failed_verify_keeps_pending_secret() {
        let f = fixture().await;
        let setup = f.service.begin_setup(&f.app_id, "U1").await.unwrap();

        let result = f.service.verify_code(&f.app_id, "U1", "12ab56").await;
        assert!(matches!(result, Err(AppError::InvalidCode)));

        // 同じシークレットで再試行できる
        let code = current_code(&setup.secret);
        assert_eq!(
            f.service.verify_code(&f.app_id, "U1", &code).await.unwrap(),
            TotpVerification::Activated
        );
    }

    #[tokio::test]
    async fn test_resetup_replaces_pending_secret() {
        let f = fixture().await;
        let first = f.service.begin_setup(&f.app_id, "U1").await.unwrap();
        let second = f.service.begin_setup(&f.app_id, "U1").await.unwrap();
        assert_ne!(first.secret, second.secret);

        let code = current_code(&second.secret);
        assert!(f.service.verify_code(&f.app_id, "U1", &code).await.is_ok());
    }

    #[tokio::test]
    async fn test_setup_rejected_once_active() {
        let f = fixture().await;
        let setup = f.service.begin_setup(&f.app_id, "U1").await.unwrap();
        let code = current_code(&setup.secret);
        f.service.verify_code(&f.app_id, "U1", &code).await.unwrap();

        let result = f.service.begin_setup(&f.app_id, "U1").await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_reset_returns_to_unenrolled() {
        let f = fixture().await;
        let setup = f.service.begin_setup(&f.app_id, "U1").await.unwrap();
        let code = current_code(&setup.secret);
        f.service.verify_code(&f.app_id, "U1", &code).await.unwrap();

        f.service
            .reset(&f.app_id, "U1", ResetScope::All)
            .await
            .unwrap();
        assert_eq!(
            f.service.totp_state(&f.app_id, "U1").await.unwrap(),
            TotpState::Unenrolled
        );

        let again = f.service.begin_setup(&f.app_id, "U1").await.unwrap();
        assert_ne!(again.secret, setup.secret);
    }

    #[tokio::test]
    async fn test_reset_unknown_user() {
        let f = fixture().await;
        let result = f.service.reset(&f.app_id, "ghost", ResetScope::All).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_verify_activates_once() {
        let f = fixture().await;
        let setup = f.service.begin_setup(&f.app_id, "U1").await.unwrap();
        let code = current_code(&setup.secret);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let service = f.service.clone();
                let app_id = f.app_id.clone();
                let code = code.clone();
                tokio::spawn(async move { service.verify_code(&app_id, "U1", &code).await })
            })
            .collect();

        let mut activated = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == TotpVerification::Activated {
                activated += 1;
            }
        }

        assert_eq!(activated, 1);
        assert_eq!(
            f.service.totp_state(&f.app_id, "U1").await.unwrap(),
            TotpState::TotpActive
        );
    }
}
