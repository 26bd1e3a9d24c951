//! 企業微信 (WeCom) 連携
//!
//! - バインド: OAuth2 認可（snsapi_base）で userid を取得
//! - プッシュ承認: アプリメッセージ（markdown）で承認/拒否リンクを送信

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;
use crate::services::channel::{ApprovalPrompt, ChannelProvider};

const WECOM_AUTHORIZE_URL: &str = "https://open.weixin.qq.com/connect/oauth2/authorize";
const WECOM_API_BASE: &str = "https://qyapi.weixin.qq.com";

/// アクセストークンの期限より少し前に再取得する
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// アクセストークン失効を示すエラーコード
const TOKEN_EXPIRED_CODES: [i64; 2] = [40014, 42001];

/// WeCom API 共通のエラー部
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(flatten)]
    status: ApiStatus,
    access_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(flatten)]
    status: ApiStatus,
    /// 企業メンバーの場合のみ
    #[serde(alias = "UserId")]
    userid: Option<String>,
}

#[derive(Debug, Serialize)]
struct MarkdownMessage<'a> {
    touser: &'a str,
    msgtype: &'static str,
    agentid: i64,
    markdown: MarkdownContent,
}

#[derive(Debug, Serialize)]
struct MarkdownContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(flatten)]
    status: ApiStatus,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// WeCom API クライアント
///
/// # Security
/// - corp secret・アクセストークンはログに出力しない
#[derive(Clone)]
pub struct WeComClient {
    corp_id: String,
    agent_id: i64,
    /// アプリケーションシークレット（機密情報 - ログ出力禁止）
    secret: Arc<String>,
    api_base: String,
    http_client: reqwest::Client,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl WeComClient {
    pub fn new(corp_id: String, agent_id: &str, secret: String) -> Result<Self, AppError> {
        let agent_id = agent_id.trim().parse::<i64>().map_err(|e| {
            tracing::error!(error = ?e, "WECOM_AGENT_ID が数値ではない");
            AppError::Internal(anyhow::anyhow!("invalid wecom agent id"))
        })?;

        Ok(Self {
            corp_id,
            agent_id,
            secret: Arc::new(secret),
            api_base: WECOM_API_BASE.to_string(),
            http_client: reqwest::Client::new(),
            token: Arc::new(Mutex::new(None)),
        })
    }

    /// API のベースURLを差し替え（プロキシ経由など）
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// キャッシュ済みのアクセストークンを返す（期限が近ければ再取得）
    async fn access_token(&self) -> Result<String, AppError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.value.clone());
        }

        let url = reqwest::Url::parse_with_params(
            &format!("{}/cgi-bin/gettoken", self.api_base),
            &[("corpid", self.corp_id.as_str()), ("corpsecret", self.secret.as_str())],
        )
        .map_err(|e| AppError::Internal(e.into()))?;

        let response: TokenResponse = self.get_json(url).await?;
        check_status(&response.status, "gettoken")?;
        let value = response.access_token.ok_or_else(|| {
            tracing::error!("WeCom gettoken にアクセストークンが含まれていない");
            AppError::Channel("access token missing".to_string())
        })?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        tracing::debug!(expires_in = response.expires_in, "WeCom アクセストークン取得");
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn get_json<T: DeserializeOwned>(&self, url: reqwest::Url) -> Result<T, AppError> {
        let response = self.http_client.get(url).send().await?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, AppError> {
        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, "WeCom API エラー");
            return Err(AppError::Channel(format!("wecom returned status: {}", status)));
        }

        response.json().await.map_err(|e| {
            tracing::error!(error = ?e, "WeCom レスポンスのパースエラー");
            AppError::Channel("failed to parse wecom response".to_string())
        })
    }

    /// トークン失効エラーならキャッシュを破棄
    async fn handle_status(&self, status: &ApiStatus, api: &str) -> Result<(), AppError> {
        if TOKEN_EXPIRED_CODES.contains(&status.errcode) {
            self.invalidate_token().await;
        }
        check_status(status, api)
    }
}

#[async_trait]
impl ChannelProvider for WeComClient {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<String, AppError> {
        build_authorize_url(&self.corp_id, self.agent_id, redirect_uri, state)
    }

    async fn resolve_account(&self, code: &str) -> Result<String, AppError> {
        let token = self.access_token().await?;
        let url = reqwest::Url::parse_with_params(
            &format!("{}/cgi-bin/auth/getuserinfo", self.api_base),
            &[("access_token", token.as_str()), ("code", code)],
        )
        .map_err(|e| AppError::Internal(e.into()))?;

        let response: UserInfoResponse = self.get_json(url).await?;
        self.handle_status(&response.status, "getuserinfo").await?;

        // 企業外ユーザー（openid のみ）は連携できない
        response.userid.filter(|id| !id.is_empty()).ok_or_else(|| {
            tracing::warn!("WeCom ユーザーが企業メンバーではない");
            AppError::Validation("企業微信の企業メンバーのみ連携できます".to_string())
        })
    }

    async fn send_approval_prompt(
        &self,
        account_id: &str,
        prompt: &ApprovalPrompt,
    ) -> Result<(), AppError> {
        let token = self.access_token().await?;
        let url = reqwest::Url::parse_with_params(
            &format!("{}/cgi-bin/message/send", self.api_base),
            &[("access_token", token.as_str())],
        )
        .map_err(|e| AppError::Internal(e.into()))?;

        let body = MarkdownMessage {
            touser: account_id,
            msgtype: "markdown",
            agentid: self.agent_id,
            markdown: MarkdownContent {
                content: render_prompt(prompt),
            },
        };

        let response = self.http_client.post(url).json(&body).send().await?;
        let response: SendResponse = Self::parse_response(response).await?;
        self.handle_status(&response.status, "message/send").await?;

        tracing::debug!("WeCom 承認メッセージ送信");
        Ok(())
    }
}

/// 認可URLを構築
///
/// `#wechat_redirect` は WeCom の仕様で必須
fn build_authorize_url(
    corp_id: &str,
    agent_id: i64,
    redirect_uri: &str,
    state: &str,
) -> Result<String, AppError> {
    let agent_id = agent_id.to_string();
    let params = [
        ("appid", corp_id),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("scope", "snsapi_base"),
        ("state", state),
        ("agentid", agent_id.as_str()),
    ];

    let mut url = reqwest::Url::parse_with_params(WECOM_AUTHORIZE_URL, &params).map_err(|e| {
        tracing::error!(error = ?e, "WeCom 認可URL生成エラー");
        AppError::Internal(anyhow::anyhow!("failed to generate authorize url"))
    })?;
    url.set_fragment(Some("wechat_redirect"));

    Ok(url.to_string())
}

fn render_prompt(prompt: &ApprovalPrompt) -> String {
    let expires_at = prompt
        .expires_at
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();

    format!(
        "**ログイン承認リクエスト**\n\
         > アプリケーション: {}\n\
         > ユーザー: {}\n\
         > 有効期限: {}\n\n\
         [承認する]({})\n\n\
         [拒否する]({})",
        prompt.app_name, prompt.user_id, expires_at, prompt.approve_url, prompt.deny_url
    )
}

fn check_status(status: &ApiStatus, api: &str) -> Result<(), AppError> {
    if status.errcode != 0 {
        tracing::error!(api = %api, errcode = status.errcode, errmsg = %status.errmsg, "WeCom API エラー");
        return Err(AppError::Channel(format!(
            "wecom {} failed: {} {}",
            api, status.errcode, status.errmsg
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> WeComClient {
        WeComClient::new("ww123".to_string(), "1000002", "corp-secret".to_string())
            .unwrap()
            .with_api_base(server.uri())
    }

    fn sample_prompt() -> ApprovalPrompt {
        ApprovalPrompt {
            app_name: "Portal".to_string(),
            user_id: "U1".to_string(),
            approve_url: "https://gw.example/channel/approvals/1?token=t&decision=approve"
                .to_string(),
            deny_url: "https://gw.example/channel/approvals/1?token=t&decision=deny".to_string(),
            expires_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    async fn mount_gettoken(server: &MockServer, times: u64) {
        Mock::given(method("GET"))
            .and(path("/cgi-bin/gettoken"))
            .and(query_param("corpid", "ww123"))
            .and(query_param("corpsecret", "corp-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 0,
                "errmsg": "ok",
                "access_token": "tok-1",
                "expires_in": 7200
            })))
            .expect(times)
            .mount(server)
            .await;
    }

    #[test]
    fn test_build_authorize_url() {
        let url = build_authorize_url(
            "ww123",
            1000002,
            "https://gw.example/channel/wecom/callback",
            "sealed-state",
        )
        .unwrap();

        assert!(url.starts_with(WECOM_AUTHORIZE_URL));
        assert!(url.ends_with("#wechat_redirect"));
        assert!(url.contains("appid=ww123"));
        assert!(url.contains("scope=snsapi_base"));
        assert!(url.contains("agentid=1000002"));
        assert!(url.contains("state=sealed-state"));
        assert!(
            url.contains("redirect_uri=https%3A%2F%2Fgw.example%2Fchannel%2Fwecom%2Fcallback")
        );
    }

    #[test]
    fn test_new_rejects_non_numeric_agent_id() {
        assert!(WeComClient::new("ww123".to_string(), "agent", "s".to_string()).is_err());
        assert!(WeComClient::new("ww123".to_string(), " 1000002 ", "s".to_string()).is_ok());
    }

    #[test]
    fn test_parse_userinfo_response() {
        let member: UserInfoResponse =
            serde_json::from_str(r#"{"errcode":0,"errmsg":"ok","userid":"zhangsan"}"#).unwrap();
        assert_eq!(member.userid.as_deref(), Some("zhangsan"));
        assert!(check_status(&member.status, "getuserinfo").is_ok());

        let outsider: UserInfoResponse =
            serde_json::from_str(r#"{"errcode":0,"errmsg":"ok","openid":"o-abc"}"#).unwrap();
        assert!(outsider.userid.is_none());
    }

    #[test]
    fn test_error_code_maps_to_channel_error() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"errcode":40001,"errmsg":"invalid credential"}"#).unwrap();
        assert!(response.access_token.is_none());
        assert!(matches!(
            check_status(&response.status, "gettoken"),
            Err(AppError::Channel(_))
        ));
    }

    #[test]
    fn test_markdown_message_shape() {
        let prompt = sample_prompt();

        let body = serde_json::to_value(MarkdownMessage {
            touser: "zhangsan",
            msgtype: "markdown",
            agentid: 1000002,
            markdown: MarkdownContent {
                content: render_prompt(&prompt),
            },
        })
        .unwrap();

        assert_eq!(body["touser"], "zhangsan");
        assert_eq!(body["agentid"], 1000002);
        let content = body["markdown"]["content"].as_str().unwrap();
        assert!(content.contains("Portal"));
        assert!(content.contains("decision=approve"));
        assert!(content.contains("decision=deny"));
    }

    #[tokio::test]
    async fn test_access_token_is_cached_across_calls() {
        let server = MockServer::start().await;
        mount_gettoken(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/cgi-bin/auth/getuserinfo"))
            .and(query_param("access_token", "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 0,
                "errmsg": "ok",
                "userid": "zhangsan"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.resolve_account("code-1").await.unwrap(), "zhangsan");
        assert_eq!(client.resolve_account("code-2").await.unwrap(), "zhangsan");
    }

    #[tokio::test]
    async fn test_expired_token_is_refetched() {
        let server = MockServer::start().await;
        mount_gettoken(&server, 2).await;

        Mock::given(method("GET"))
            .and(path("/cgi-bin/auth/getuserinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 42001,
                "errmsg": "access_token expired"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/auth/getuserinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 0,
                "errmsg": "ok",
                "UserId": "lisi"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(matches!(
            client.resolve_account("code-1").await,
            Err(AppError::Channel(_))
        ));
        assert!(client.token.lock().await.is_none());
        assert_eq!(client.resolve_account("code-2").await.unwrap(), "lisi");
    }

    #[tokio::test]
    async fn test_non_member_cannot_bind() {
        let server = MockServer::start().await;
        mount_gettoken(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/cgi-bin/auth/getuserinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 0,
                "errmsg": "ok",
                "openid": "o-abc"
            })))
            .mount(&server)
            .await;

        let result = client_for(&server).resolve_account("code-1").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_send_approval_prompt() {
        let server = MockServer::start().await;
        mount_gettoken(&server, 1).await;

        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/send"))
            .and(query_param("access_token", "tok-1"))
            .and(body_partial_json(json!({
                "touser": "zhangsan",
                "msgtype": "markdown",
                "agentid": 1000002
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 0,
                "errmsg": "ok"
            })))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .send_approval_prompt("zhangsan", &sample_prompt())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_error_code_maps_to_channel_error() {
        let server = MockServer::start().await;
        mount_gettoken(&server, 1).await;

        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/send"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 81013,
                "errmsg": "user & party & tag all invalid"
            })))
            .mount(&server)
            .await;

        let result = client_for(&server)
            .send_approval_prompt("ghost", &sample_prompt())
            .await;
        assert!(matches!(result, Err(AppError::Channel(_))));
    }

    #[tokio::test]
    async fn test_http_error_status_maps_to_channel_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/cgi-bin/gettoken"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let result = client_for(&server).resolve_account("code-1").await;
        assert!(matches!(result, Err(AppError::Channel(_))));
    }
}
