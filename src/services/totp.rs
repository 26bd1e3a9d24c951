use data_encoding::BASE32;
use rand::RngCore;
use totp_rs::{Algorithm, TOTP};

use crate::error::AppError;

const DIGITS: usize = 6;
/// 前後1ステップの時間ウィンドウを許容（±30秒）
const SKEW: u8 = 1;
const STEP_SECS: u64 = 30;
/// 160ビット
const SECRET_LEN: usize = 20;

/// プロビジョニングペイロード
#[derive(Debug, Clone)]
pub struct Provisioning {
    /// otpauth://totp/... URI
    pub otpauth_url: String,
    /// QRコード（PNG、Base64エンコード）
    pub qr_code: String,
}

/// TOTP (Time-based One-Time Password) エンジン
///
/// 保存と状態遷移は持たない。シークレットの生成・QR描画・コード検証のみ。
///
/// # Security
/// - シークレット平文・コードはログに出力しない
#[derive(Clone, Default)]
pub struct TotpEngine;

impl TotpEngine {
    pub fn new() -> Self {
        Self
    }

    /// 20バイトのランダムシークレットを生成し、Base32でエンコード
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        BASE32.encode(&bytes)
    }

    /// プロビジョニングURIとQRコードを生成
    ///
    /// # Arguments
    /// * `issuer` - 発行者名（アプリケーション名）
    /// * `account` - アカウント識別子（連携元の user_id）
    /// * `secret` - Base32エンコードされたシークレット
    pub fn provisioning(
        &self,
        issuer: &str,
        account: &str,
        secret: &str,
    ) -> Result<Provisioning, AppError> {
        let totp = Self::build(secret, Some(label(issuer)), label(account))?;

        let qr_code = totp.get_qr_base64().map_err(|e| {
            tracing::error!(error = %e, "QRコード生成エラー");
            AppError::Internal(anyhow::anyhow!("qr code generation error"))
        })?;

        Ok(Provisioning {
            otpauth_url: totp.get_url(),
            qr_code,
        })
    }

    /// 現在時刻でTOTPコードを検証
    pub fn verify_code(&self, secret: &str, code: &str) -> Result<bool, AppError> {
        let current_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!(error = ?e, "システム時刻取得エラー");
                AppError::Internal(anyhow::anyhow!("system time error"))
            })?
            .as_secs();

        self.verify_code_at(secret, code, current_time)
    }

    /// 指定時刻でTOTPコードを検証
    ///
    /// # Note
    /// 形式不正のコードは不一致として扱う（理由を区別しない）
    pub fn verify_code_at(&self, secret: &str, code: &str, unix_time: u64) -> Result<bool, AppError> {
        if !is_well_formed(code) {
            return Ok(false);
        }

        let totp = Self::build(secret, None, String::new())?;
        // check は内部で skew を考慮して検証
        Ok(totp.check(code, unix_time))
    }

    /// 指定時刻のコードを生成
    pub fn code_at(&self, secret: &str, unix_time: u64) -> Result<String, AppError> {
        Ok(Self::build(secret, None, String::new())?.generate(unix_time))
    }

    fn build(secret: &str, issuer: Option<String>, account: String) -> Result<TOTP, AppError> {
        let secret_bytes = BASE32.decode(secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレットのBase32デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid base32 secret"))
        })?;

        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP_SECS,
            secret_bytes,
            issuer,
            account,
        )
        .map_err(|e| {
            tracing::error!(error = %e, "TOTP作成エラー");
            AppError::Internal(anyhow::anyhow!("totp creation error"))
        })
    }
}

/// コードは6桁の数字のみ
pub fn is_well_formed(code: &str) -> bool {
    code.len() == DIGITS && code.chars().all(|c| c.is_ascii_digit())
}

/// otpauth ラベルに ':' は使えない
fn label(value: &str) -> String {
    value.replace(':', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_010;

    #[test]
    fn test_generate_secret() {
        let secret = TotpEngine::generate_secret();
        // Base32エンコードされた20バイト = 32文字
        assert_eq!(secret.len(), 32);
        assert!(
            secret
                .chars()
                .all(|c| "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567".contains(c))
        );
        assert_ne!(secret, TotpEngine::generate_secret());
    }

    #[test]
    fn test_provisioning_payload() {
        let engine = TotpEngine::new();
        let secret = TotpEngine::generate_secret();

        let payload = engine
            .provisioning("Client: Portal", "user:42", &secret)
            .unwrap();
        assert!(payload.otpauth_url.starts_with("otpauth://totp/"));
        assert!(payload.otpauth_url.contains(&secret));
        assert!(payload.otpauth_url.contains("issuer="));
        assert!(!payload.qr_code.is_empty());
    }

    #[test]
    fn test_verify_current_and_adjacent_steps() {
        let engine = TotpEngine::new();
        let secret = TotpEngine::generate_secret();

        let current = engine.code_at(&secret, NOW).unwrap();
        let previous = engine.code_at(&secret, NOW - STEP_SECS).unwrap();
        let next = engine.code_at(&secret, NOW + STEP_SECS).unwrap();

        assert!(engine.verify_code_at(&secret, &current, NOW).unwrap());
        assert!(engine.verify_code_at(&secret, &previous, NOW).unwrap());
        assert!(engine.verify_code_at(&secret, &next, NOW).unwrap());
    }

    #[test]
    fn test_verify_rejects_codes_beyond_one_step() {
        let engine = TotpEngine::new();
        let secret = TotpEngine::generate_secret();

        let accepted: Vec<String> = [NOW - STEP_SECS, NOW, NOW + STEP_SECS]
            .iter()
            .map(|t| engine.code_at(&secret, *t).unwrap())
            .collect();

        for far in [
            NOW - 2 * STEP_SECS,
            NOW + 2 * STEP_SECS,
            NOW - 3 * STEP_SECS,
        ] {
            let code = engine.code_at(&secret, far).unwrap();
            // 偶然一致する場合を除外
            if !accepted.contains(&code) {
                assert!(!engine.verify_code_at(&secret, &code, NOW).unwrap());
            }
        }
    }

    #[test]
    fn test_verify_invalid_code_format() {
        let engine = TotpEngine::new();
        let secret = TotpEngine::generate_secret();

        // 6桁でない
        assert!(!engine.verify_code(&secret, "12345").unwrap());
        // 数字以外を含む
        assert!(!engine.verify_code(&secret, "12345a").unwrap());
    }
}
