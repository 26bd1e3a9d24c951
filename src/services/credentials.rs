use std::sync::Arc;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::Application;
use crate::repositories::{ApplicationPatch, ApplicationStore, NewApplication};
use crate::services::crypto::{SecretCipher, constant_time_eq, random_token};

const APP_SECRET_BYTES: usize = 32;
const MAX_NAME_LEN: usize = 100;

/// 発行直後の資格情報
///
/// app_secret を平文で持つのはこの型だけ（作成・ローテーション・明示的開示の応答）
#[derive(Debug)]
pub struct IssuedCredentials {
    pub application: Application,
    pub app_secret: String,
}

/// アプリケーション作成入力
#[derive(Debug, Clone)]
pub struct NewApplicationInput {
    pub name: String,
    pub description: String,
    pub callback_url: Option<String>,
}

/// 資格情報ストア
///
/// # Security
/// - app_secret はログに出力しない
/// - app_secret は暗号化して保存
#[derive(Clone)]
pub struct CredentialService {
    apps: Arc<dyn ApplicationStore>,
    cipher: SecretCipher,
}

impl CredentialService {
    pub fn new(apps: Arc<dyn ApplicationStore>, cipher: SecretCipher) -> Self {
        Self { apps, cipher }
    }

    /// アプリケーションを登録し、app_id / app_secret を発行
    pub async fn create_application(
        &self,
        input: NewApplicationInput,
    ) -> Result<IssuedCredentials, AppError> {
        let name = validate_name(&input.name)?;
        let callback_url = input
            .callback_url
            .as_deref()
            .map(validate_callback_url)
            .transpose()?;

        let app_secret = random_token(APP_SECRET_BYTES);
        let secret_encrypted = self.cipher.encrypt_str(&app_secret)?;

        let application = self
            .apps
            .insert(NewApplication {
                name,
                description: input.description.trim().to_string(),
                app_id: Uuid::new_v4().to_string(),
                secret_encrypted,
                callback_url,
            })
            .await?;

        tracing::info!(app_id = %application.app_id, name = %application.name, "アプリケーション登録");

        Ok(IssuedCredentials {
            application,
            app_secret,
        })
    }

    /// 可変フィールド（name / description / callback_url）を更新
    ///
    /// # Note
    /// app_id / app_secret は変更しない
    pub async fn update_application(
        &self,
        app_id: &str,
        patch: ApplicationPatch,
    ) -> Result<Application, AppError> {
        let patch = ApplicationPatch {
            name: patch.name.as_deref().map(validate_name).transpose()?,
            description: patch.description.map(|d| d.trim().to_string()),
            callback_url: patch
                .callback_url
                .as_deref()
                .map(validate_callback_url)
                .transpose()?,
        };

        let application = self
            .apps
            .update(app_id, &patch)
            .await?
            .ok_or(AppError::NotFound("アプリケーション"))?;

        tracing::info!(app_id = %app_id, "アプリケーション更新");

        Ok(application)
    }

    pub async fn get_application(&self, app_id: &str) -> Result<Application, AppError> {
        self.apps
            .find_by_app_id(app_id)
            .await?
            .ok_or(AppError::NotFound("アプリケーション"))
    }

    pub async fn list_applications(&self) -> Result<Vec<Application>, AppError> {
        Ok(self.apps.list().await?)
    }

    /// app_secret をローテーション
    ///
    /// 旧シークレットで署名済みのハンドオフトークンは検証できなくなる
    pub async fn rotate_secret(&self, app_id: &str) -> Result<IssuedCredentials, AppError> {
        let app_secret = random_token(APP_SECRET_BYTES);
        let secret_encrypted = self.cipher.encrypt_str(&app_secret)?;

        let application = self
            .apps
            .update_secret(app_id, &secret_encrypted)
            .await?
            .ok_or(AppError::NotFound("アプリケーション"))?;

        tracing::info!(app_id = %app_id, "app_secret ローテーション");

        Ok(IssuedCredentials {
            application,
            app_secret,
        })
    }

    /// 管理者による明示的な開示
    pub async fn reveal_secret(&self, app_id: &str) -> Result<IssuedCredentials, AppError> {
        let application = self.get_application(app_id).await?;
        let app_secret = self.secret_of(&application)?;

        tracing::info!(app_id = %app_id, "app_secret 開示");

        Ok(IssuedCredentials {
            application,
            app_secret,
        })
    }

    /// 保存済み app_secret を復号
    pub fn secret_of(&self, application: &Application) -> Result<String, AppError> {
        self.cipher
            .decrypt_to_string(&application.secret_encrypted)
    }

    /// 連携元アプリケーションからの呼び出しを app_id / app_secret で認証
    pub async fn authenticate(
        &self,
        app_id: &str,
        presented_secret: &str,
    ) -> Result<Application, AppError> {
        let Some(application) = self.apps.find_by_app_id(app_id).await? else {
            tracing::warn!(app_id = %app_id, "アプリ認証失敗: アプリ不在");
            return Err(AppError::Unauthorized);
        };

        let secret = self.secret_of(&application)?;
        if !constant_time_eq(&secret, presented_secret) {
            tracing::warn!(app_id = %app_id, "アプリ認証失敗: シークレット不一致");
            return Err(AppError::Unauthorized);
        }

        Ok(application)
    }
}

fn validate_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation(
            "アプリケーション名は必須です".to_string(),
        ));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "アプリケーション名は{}文字以内で入力してください",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// コールバックURLのバリデーション
///
/// http / https の絶対URLのみ。フラグメント付きは拒否（クエリ追加後に失われるため）
pub fn validate_callback_url(raw: &str) -> Result<String, AppError> {
    let invalid = || {
        AppError::Validation("コールバックURLは http(s) の絶対URLで入力してください".to_string())
    };

    let url = url::Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    if url.fragment().is_some() {
        return Err(AppError::Validation(
            "コールバックURLにフラグメントは指定できません".to_string(),
        ));
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::repositories::InMemoryApplicationStore;

    fn service() -> CredentialService {
        CredentialService::new(
            Arc::new(InMemoryApplicationStore::default()),
            SecretCipher::from_key([9u8; 32]),
        )
    }

    fn input(name: &str, callback_url: Option<&str>) -> NewApplicationInput {
        NewApplicationInput {
            name: name.to_string(),
            description: "desc".to_string(),
            callback_url: callback_url.map(str::to_string),
        }
    }

    #[test]
    fn test_validate_callback_url() {
        assert!(validate_callback_url("https://client.example/cb").is_ok());
        assert!(validate_callback_url("http://localhost:3000/cb?x=1").is_ok());
        assert!(validate_callback_url("/relative/path").is_err());
        assert!(validate_callback_url("ftp://client.example/cb").is_err());
        assert!(validate_callback_url("javascript:alert(1)").is_err());
        assert!(validate_callback_url("https://client.example/cb#frag").is_err());
        assert!(validate_callback_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_app_ids_are_distinct() {
        let service = service();
        let mut ids = HashSet::new();
        for i in 0..50 {
            let issued = service
                .create_application(input(&format!("app-{i}"), None))
                .await
                .unwrap();
            assert!(ids.insert(issued.application.app_id));
        }
    }

    #[tokio::test]
    async fn test_create_rejects_bad_callback() {
        let result = service()
            .create_application(input("App", Some("not-a-url")))
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_empty_name() {
        let result = service().create_application(input("   ", None)).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_update_does_not_touch_credentials() {
        let service = service();
        let issued = service
            .create_application(input("App", Some("https://client.example/cb")))
            .await
            .unwrap();
        let app_id = issued.application.app_id.clone();

        let updated = service
            .update_application(
                &app_id,
                ApplicationPatch {
                    name: Some("Renamed".to_string()),
                    callback_url: Some("https://client.example/new".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.app_id, app_id);
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.description, "desc");
        assert_eq!(
            updated.callback_url.as_deref(),
            Some("https://client.example/new")
        );
        assert_eq!(service.secret_of(&updated).unwrap(), issued.app_secret);
    }

    #[tokio::test]
    async fn test_update_unknown_app() {
        let result = service()
            .update_application("missing", ApplicationPatch::default())
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rotate_and_authenticate() {
        let service = service();
        let issued = service
            .create_application(input("App", None))
            .await
            .unwrap();
        let app_id = issued.application.app_id.clone();

        assert!(
            service
                .authenticate(&app_id, &issued.app_secret)
                .await
                .is_ok()
        );

        let rotated = service.rotate_secret(&app_id).await.unwrap();
        assert_ne!(rotated.app_secret, issued.app_secret);
        assert!(matches!(
            service.authenticate(&app_id, &issued.app_secret).await,
            Err(AppError::Unauthorized)
        ));

        let revealed = service.reveal_secret(&app_id).await.unwrap();
        assert_eq!(revealed.app_secret, rotated.app_secret);
    }
}
