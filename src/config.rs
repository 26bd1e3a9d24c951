use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// 未設定の場合はインメモリストアで起動（開発用）
    #[serde(default)]
    pub database_url: Option<SecretBox<String>>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// AES-256暗号化キー（Base64エンコード、32バイト）
    ///
    /// TOTPシークレット・app_secret の保存時暗号化、バインド state の暗号化に使用
    pub encryption_key: SecretBox<String>,
    /// 管理 API の Bearer トークン
    pub admin_token: SecretBox<String>,
    /// 外部から到達可能なこのサービスのベースURL（コールバック・承認リンク生成用）
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    // ハンドオフトークン設定
    #[serde(default = "default_handoff_token_ttl_secs")]
    pub handoff_token_ttl_secs: i64,

    // プッシュ承認設定
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: i64,
    /// ロングポーリング1回あたりの最大待機秒数
    #[serde(default = "default_approval_max_wait_secs")]
    pub approval_max_wait_secs: u64,

    // 企業微信 (WeCom) 設定（オプション - 3つ揃った場合のみ有効）
    #[serde(default)]
    pub wecom_corp_id: Option<String>,
    #[serde(default)]
    pub wecom_agent_id: Option<String>,
    pub wecom_secret: Option<SecretBox<String>>,

    /// カンマ区切りの CORS 許可オリジン（未設定なら全許可）
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_HANDOFF_TOKEN_TTL_SECS: i64 = 60;
const DEFAULT_APPROVAL_TIMEOUT_SECS: i64 = 120;
const DEFAULT_APPROVAL_MAX_WAIT_SECS: u64 = 25;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_public_base_url() -> String {
    DEFAULT_PUBLIC_BASE_URL.to_string()
}

fn default_handoff_token_ttl_secs() -> i64 {
    DEFAULT_HANDOFF_TOKEN_TTL_SECS
}

fn default_approval_timeout_secs() -> i64 {
    DEFAULT_APPROVAL_TIMEOUT_SECS
}

fn default_approval_max_wait_secs() -> u64 {
    DEFAULT_APPROVAL_MAX_WAIT_SECS
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// CORS 許可オリジン一覧
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, envy::Error> {
        envy::from_iter(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[test]
    fn test_defaults_applied() {
        let config = from_pairs(&[
            ("ENCRYPTION_KEY", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
            ("ADMIN_TOKEN", "admin"),
        ])
        .unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.handoff_token_ttl_secs, 60);
        assert_eq!(config.approval_timeout_secs, 120);
        assert!(config.wecom_secret.is_none());
        assert!(config.cors_origins().is_empty());
    }

    #[test]
    fn test_missing_encryption_key_fails() {
        let result = from_pairs(&[("ADMIN_TOKEN", "admin")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cors_origins_parsed() {
        let config = from_pairs(&[
            ("ENCRYPTION_KEY", "key"),
            ("ADMIN_TOKEN", "admin"),
            (
                "CORS_ALLOWED_ORIGINS",
                "http://localhost:5173, https://admin.example ,",
            ),
        ])
        .unwrap();

        assert_eq!(
            config.cors_origins(),
            vec!["http://localhost:5173", "https://admin.example"]
        );
    }
}
