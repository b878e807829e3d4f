use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{LarkError, LarkResult};
use crate::config::Config;

const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;

/// Delivers reply text to a chat user.
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    async fn send_text(&self, user_id: &str, text: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct TenantAccessTokenResponse {
    code: i64,
    msg: String,
    tenant_access_token: Option<String>,
    expire: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    msg: String,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Lark Open Platform client authenticated as the bot application.
pub struct LarkClient {
    base_url: String,
    app_id: String,
    app_secret: String,
    http: reqwest::Client,
    token: Arc<RwLock<Option<CachedToken>>>,
}

impl LarkClient {
    pub fn new(base_url: &str, app_id: &str, app_secret: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.lark_base_url, &config.lark_app_id, &config.lark_app_secret)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/open-apis{}", self.base_url, path)
    }

    /// Cached tenant access token, refreshed shortly before it expires.
    async fn tenant_access_token(&self) -> LarkResult<String> {
        {
            let cached = self.token.read().await;
            if let Some(ref cached) = *cached {
                if cached.expires_at > Instant::now() + Duration::from_secs(TOKEN_REFRESH_MARGIN_SECS) {
                    return Ok(cached.token.clone());
                }
            }
        }

        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let data: TenantAccessTokenResponse = self
            .http
            .post(self.api_url("/auth/v3/tenant_access_token/internal"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if data.code != 0 {
            return Err(LarkError::Api {
                code: data.code,
                msg: data.msg,
            });
        }

        let token = data.tenant_access_token.ok_or_else(|| LarkError::Api {
            code: data.code,
            msg: "missing tenant_access_token".to_string(),
        })?;
        let expire = data.expire.unwrap_or(7200);

        *self.token.write().await = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expire),
        });

        debug!("Lark tenant access token refreshed, expires in {} seconds", expire);
        Ok(token)
    }

    /// Sends a plain text message to the user identified by `open_id`.
    pub async fn send_text_message(&self, open_id: &str, text: &str) -> LarkResult<()> {
        let token = self.tenant_access_token().await?;

        let body = serde_json::json!({
            "receive_id": open_id,
            "msg_type": "text",
            "content": serde_json::json!({ "text": text }).to_string(),
        });

        let data: ApiResponse = self
            .http
            .post(self.api_url("/im/v1/messages"))
            .query(&[("receive_id_type", "open_id")])
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if data.code != 0 {
            return Err(LarkError::Api {
                code: data.code,
                msg: data.msg,
            });
        }

        info!("Lark message sent to {}", open_id);
        Ok(())
    }
}

#[async_trait]
impl ReplyDispatcher for LarkClient {
    async fn send_text(&self, user_id: &str, text: &str) -> anyhow::Result<()> {
        self.send_text_message(user_id, text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        let client = LarkClient::new("https://open.larksuite.com/", "cli_app", "secret");
        assert_eq!(
            client.api_url("/im/v1/messages"),
            "https://open.larksuite.com/open-apis/im/v1/messages"
        );
    }
}
