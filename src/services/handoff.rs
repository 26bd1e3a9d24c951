//! ハンドオフトークンの発行・検証
//!
//! 形式: `v1.<payload>.<signature>`
//! - payload: クレームの JSON を Base64 URL-safe エンコード
//! - signature: `v1.<payload>` に対する HMAC-SHA256（鍵はアプリケーションの app_secret）
//!
//! 連携元アプリケーションは署名と有効期限をサーバー側で検証すること。
//! `/handoff/redeem` を使えば jti の使い捨ても保証される。

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::error::AppError;
use crate::models::Application;
use crate::repositories::HandoffLedger;
use crate::services::credentials::CredentialService;
use crate::services::crypto::random_token;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";

/// ハンドオフトークンのクレーム
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffClaims {
    pub app_id: String,
    /// 連携元の user_id
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// 使い捨てマーカー
    pub jti: String,
}

/// 検証成功後の引き渡し結果
#[derive(Debug, Clone)]
pub struct Handoff {
    pub token: String,
    pub redirect_url: String,
}

#[derive(Clone)]
pub struct HandoffIssuer {
    credentials: CredentialService,
    ledger: Arc<dyn HandoffLedger>,
    ttl: Duration,
}

impl HandoffIssuer {
    pub fn new(credentials: CredentialService, ledger: Arc<dyn HandoffLedger>, ttl: Duration) -> Self {
        Self {
            credentials,
            ledger,
            ttl,
        }
    }

    /// トークンを発行
    ///
    /// # Note
    /// 検証成功後にのみ呼び出すこと
    pub fn issue_token(&self, application: &Application, user_id: &str) -> Result<String, AppError> {
        let secret = self.credentials.secret_of(application)?;
        let now = OffsetDateTime::now_utc();

        let claims = HandoffClaims {
            app_id: application.app_id.clone(),
            sub: user_id.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + self.ttl).unix_timestamp(),
            jti: random_token(16),
        };

        sign(&claims, &secret)
    }

    /// トークンを発行し、コールバックURLへのリダイレクトを構築
    pub fn handoff(&self, application: &Application, user_id: &str) -> Result<Handoff, AppError> {
        // コールバック未設定なら発行しない
        if application.callback_url.is_none() {
            return Err(AppError::MisconfiguredApp);
        }

        let token = self.issue_token(application, user_id)?;
        let redirect_url = build_redirect(application, &token)?;

        tracing::info!(app_id = %application.app_id, user_id = %user_id, "ハンドオフトークン発行");

        Ok(Handoff {
            token,
            redirect_url,
        })
    }

    /// 連携元アプリケーションによるトークン引き換え
    ///
    /// # Security
    /// - app_secret による呼び出し元認証
    /// - 期限切れ・使用済み・偽造はすべて InvalidToken
    pub async fn redeem(
        &self,
        app_id: &str,
        app_secret: &str,
        token: &str,
    ) -> Result<HandoffClaims, AppError> {
        let application = self.credentials.authenticate(app_id, app_secret).await?;
        let secret = self.credentials.secret_of(&application)?;

        let claims = verify_token(token, &secret, OffsetDateTime::now_utc())?;
        if claims.app_id != application.app_id {
            tracing::warn!(app_id = %app_id, "別アプリケーション宛てのトークン");
            return Err(AppError::InvalidToken);
        }

        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| AppError::InvalidToken)?;
        if !self
            .ledger
            .consume(&claims.jti, &claims.app_id, expires_at)
            .await?
        {
            tracing::warn!(app_id = %app_id, user_id = %claims.sub, "使用済みハンドオフトークン");
            return Err(AppError::InvalidToken);
        }

        tracing::info!(app_id = %app_id, user_id = %claims.sub, "ハンドオフトークン引き換え");

        Ok(claims)
    }
}

/// クレームに署名してトークン文字列を生成
pub fn sign(claims: &HandoffClaims, secret: &str) -> Result<String, AppError> {
    let payload = serde_json::to_vec(claims).map_err(|e| AppError::Internal(e.into()))?;
    let signing_input = format!("{}.{}", TOKEN_VERSION, URL_SAFE_NO_PAD.encode(payload));

    let signature = mac(secret)?
        .chain_update(signing_input.as_bytes())
        .finalize()
        .into_bytes();

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// トークンの署名と有効期限を検証
///
/// 連携元アプリケーション側の検証手順と同一
pub fn verify_token(
    token: &str,
    secret: &str,
    now: OffsetDateTime,
) -> Result<HandoffClaims, AppError> {
    let mut parts = token.split('.');
    let (Some(version), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AppError::InvalidToken);
    };
    if version != TOKEN_VERSION {
        return Err(AppError::InvalidToken);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| AppError::InvalidToken)?;
    mac(secret)?
        .chain_update(format!("{}.{}", version, payload).as_bytes())
        .verify_slice(&signature)
        .map_err(|_| AppError::InvalidToken)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AppError::InvalidToken)?;
    let claims: HandoffClaims =
        serde_json::from_slice(&payload).map_err(|_| AppError::InvalidToken)?;

    if claims.exp <= now.unix_timestamp() {
        return Err(AppError::InvalidToken);
    }

    Ok(claims)
}

/// コールバックURLにトークンをクエリパラメータとして付与
pub fn build_redirect(application: &Application, token: &str) -> Result<String, AppError> {
    let callback_url = application
        .callback_url
        .as_deref()
        .ok_or(AppError::MisconfiguredApp)?;

    let mut url = url::Url::parse(callback_url).map_err(|e| {
        tracing::error!(error = ?e, app_id = %application.app_id, "保存済みコールバックURLが不正");
        AppError::MisconfiguredApp
    })?;
    url.query_pairs_mut().append_pair("token", token);

    Ok(url.to_string())
}

fn mac(secret: &str) -> Result<HmacSha256, AppError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
        tracing::error!(error = ?e, "HMAC初期化エラー");
        AppError::Internal(anyhow::anyhow!("hmac initialization error"))
    })
}
