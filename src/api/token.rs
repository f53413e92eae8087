//! アプリアクセストークン（client_credentials）の取得とキャッシュ
//!
//! トークンスロットは非同期Mutexで保護され、期限切れ時の更新は
//! 同時に呼ばれても1回しか実行されない。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::api::helix::ApiError;
use crate::clock::Clock;

/// 期限の少し前に更新するための余裕（秒）
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

/// トークンの発行元
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn request_token(&self) -> Result<TokenResponse, ApiError>;
}

/// OAuth2 client_credentialsフロー
pub struct ClientCredentials {
    http_client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    pub fn new(
        http_client: reqwest::Client,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            http_client,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn request_token(&self) -> Result<TokenResponse, ApiError> {
        tracing::info!("🔑 Requesting Twitch app access token");

        let response = self
            .http_client
            .post(&self.token_url)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Token(format!("status {}: {}", status, body)));
        }

        Ok(response.json().await?)
    }
}

#[derive(Debug, Clone)]
struct AppToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// 遅延更新されるトークンキャッシュ
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<AppToken>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").finish_non_exhaustive()
    }
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            slot: Mutex::new(None),
        }
    }

    /// 有効なトークンを返す。期限切れなら取得し直す。
    pub async fn access_token(&self) -> Result<String, ApiError> {
        let mut slot = self.slot.lock().await;

        if let Some(token) = slot.as_ref() {
            if self.clock.now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
            tracing::debug!("🔑 App token expired, refreshing");
        }

        let response = self.source.request_token().await?;
        let lifetime = (response.expires_in - EXPIRY_MARGIN_SECS).max(0);
        let token = AppToken {
            access_token: response.access_token,
            expires_at: self.clock.now() + chrono::Duration::seconds(lifetime),
        };
        tracing::info!("✅ App token acquired, valid until {}", token.expires_at);

        let access_token = token.access_token.clone();
        *slot = Some(token);
        Ok(access_token)
    }

    /// 拒否されたトークンを破棄する。既に更新済みなら何もしない。
    pub async fn invalidate(&self, rejected: &str) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|t| t.access_token == rejected) {
            *slot = None;
        }
    }
}
