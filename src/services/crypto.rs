use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::AppError;

const NONCE_LEN: usize = 12;

/// 保存時暗号化（AES-256-GCM）
///
/// TOTPシークレット・app_secret の暗号化、バインド state の封印に使う
///
/// # Security
/// - 平文・鍵はログに出力しない
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    /// Base64エンコードされた32バイトの鍵から作成
    pub fn from_base64(key_base64: &str) -> Result<Self, AppError> {
        let key_bytes = STANDARD
            .decode(key_base64)
            .or_else(|_| URL_SAFE_NO_PAD.decode(key_base64))
            .map_err(|e| {
                tracing::error!(error = ?e, "暗号化キーのBase64デコードエラー");
                AppError::Internal(anyhow::anyhow!("invalid encryption key format"))
            })?;

        if key_bytes.len() != 32 {
            tracing::error!(
                expected = 32,
                actual = key_bytes.len(),
                "暗号化キーの長さが不正"
            );
            return Err(AppError::Internal(anyhow::anyhow!(
                "encryption key must be 32 bytes"
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);

        Ok(Self { key })
    }

    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// # Returns
    /// 96ビットnonce (12バイト) + 暗号文
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AppError> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|e| {
            tracing::error!(error = ?e, "暗号化エラー");
            AppError::Internal(anyhow::anyhow!("encryption error"))
        })?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    /// 保存データの復号
    ///
    /// 保存データの破損は内部エラーとして扱う
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, AppError> {
        self.open(encrypted).ok_or_else(|| {
            tracing::error!("保存データの復号に失敗");
            AppError::Internal(anyhow::anyhow!("decryption error"))
        })
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, AppError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_to_string(&self, encrypted: &[u8]) -> Result<String, AppError> {
        String::from_utf8(self.decrypt(encrypted)?).map_err(|e| {
            tracing::error!(error = ?e, "復号データのUTF-8変換エラー");
            AppError::Internal(anyhow::anyhow!("invalid utf-8 after decryption"))
        })
    }

    /// 文字列を暗号化し、Base64 URL-safe でエンコード（URL パラメータ用）
    pub fn seal(&self, plaintext: &str) -> Result<String, AppError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// `seal` の逆変換
    ///
    /// 外部から戻ってきた値のため、失敗はすべて InvalidToken
    pub fn unseal(&self, sealed: &str) -> Result<String, AppError> {
        let encrypted = URL_SAFE_NO_PAD.decode(sealed).map_err(|e| {
            tracing::warn!(error = ?e, "封印値のBase64デコードエラー（改ざんの可能性）");
            AppError::InvalidToken
        })?;

        let plaintext = self.open(&encrypted).ok_or_else(|| {
            tracing::warn!("封印値の復号エラー（改ざんの可能性）");
            AppError::InvalidToken
        })?;

        String::from_utf8(plaintext).map_err(|_| AppError::InvalidToken)
    }

    fn open(&self, encrypted: &[u8]) -> Option<Vec<u8>> {
        if encrypted.len() < NONCE_LEN {
            return None;
        }

        let cipher = self.cipher().ok()?;
        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .ok()
    }

    fn cipher(&self) -> Result<Aes256Gcm, AppError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })
    }
}

/// `len` バイトのランダムトークンを生成（Base64 URL-safe）
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// トークンをSHA256でハッシュ化
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 定数時間での文字列比較
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = SecretCipher::from_key([7u8; 32]);
        let encrypted = cipher.encrypt_str("JBSWY3DPEHPK3PXP").unwrap();
        // 12バイトnonce + 暗号文 + 16バイトtag
        assert!(encrypted.len() > NONCE_LEN + 16);
        assert_eq!(
            cipher.decrypt_to_string(&encrypted).unwrap(),
            "JBSWY3DPEHPK3PXP"
        );
    }

    #[test]
    fn test_decrypt_with_other_key_fails() {
        let encrypted = SecretCipher::from_key([1u8; 32])
            .encrypt_str("secret")
            .unwrap();
        assert!(SecretCipher::from_key([2u8; 32]).decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_unseal_tampered_value() {
        let cipher = SecretCipher::from_key([3u8; 32]);
        let sealed = cipher.seal("payload").unwrap();
        assert_eq!(cipher.unseal(&sealed).unwrap(), "payload");

        let mut tampered = sealed.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(matches!(
            cipher.unseal(&tampered),
            Err(AppError::InvalidToken)
        ));
        assert!(matches!(cipher.unseal("!!"), Err(AppError::InvalidToken)));
    }

    #[test]
    fn test_from_base64_rejects_short_key() {
        let short_key = STANDARD.encode([0u8; 16]);
        assert!(SecretCipher::from_base64(&short_key).is_err());
        assert!(SecretCipher::from_base64("not-valid-base64!!!").is_err());
        assert!(SecretCipher::from_base64(&STANDARD.encode([0u8; 32])).is_ok());
    }

    #[test]
    fn test_random_token_and_hash() {
        let a = random_token(32);
        let b = random_token(32);
        assert_ne!(a, b);
        // 32バイト → 43文字（パディングなし）
        assert_eq!(a.len(), 43);
        assert_eq!(hash_token(&a).len(), 64);
        assert_eq!(hash_token(&a), hash_token(&a));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("admin-token", "admin-token"));
        assert!(!constant_time_eq("admin-token", "admin-tokem"));
        assert!(!constant_time_eq("short", "longer-value"));
    }
}
