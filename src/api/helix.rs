//! Twitch Helix APIクライアント
//!
//! `GET /users`と`GET /streams`をアプリアクセストークン付きで呼び出す。
//! 401を受けた場合はトークンを破棄して1回だけ再試行する。

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::api::identity::LiveDataSource;
use crate::api::token::{ClientCredentials, TokenCache};
use crate::clock::Clock;
use crate::config::TwitchConfig;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unauthorized after token refresh")]
    Unauthorized,
    #[error("Twitch credentials are not configured (TWITCH_CLIENT_ID / TWITCH_CLIENT_SECRET)")]
    MissingCredentials,
    #[error("Token request failed: {0}")]
    Token(String),
}

/// `Client-ID`ヘッダーに送るアプリケーションID
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub struct ClientId(pub String);

/// `GET /users` の1件
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserData {
    pub id: String,
    pub login: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: String,
}

/// `GET /streams` の1件（配信中のチャンネルのみ返る）
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamData {
    pub user_id: String,
    pub user_login: String,
    #[serde(default)]
    pub viewer_count: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub game_name: String,
}

#[derive(Debug, Deserialize)]
struct HelixEnvelope<T> {
    data: Vec<T>,
}

/// streamsの1ページ上限。50件のバッチがデフォルトの20件で切られないようにする。
const STREAMS_PAGE_SIZE: &str = "100";

/// Twitch Helix APIクライアント
#[derive(Debug)]
pub struct HelixClient {
    http_client: reqwest::Client,
    base_url: String,
    client_id: ClientId,
    tokens: Arc<TokenCache>,
}

impl HelixClient {
    pub fn new(config: &TwitchConfig, clock: Arc<dyn Clock>) -> Result<Self, ApiError> {
        if !config.has_credentials() {
            return Err(ApiError::MissingCredentials);
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        let credentials = ClientCredentials::new(
            http_client.clone(),
            &config.token_url,
            &config.client_id,
            &config.client_secret,
        );
        let tokens = Arc::new(TokenCache::new(Arc::new(credentials), clock));

        let client_id = ClientId(config.client_id.clone());
        tracing::debug!("🔧 Helix client ready (client id {})", client_id);
        Ok(Self::with_tokens(http_client, &config.api_base_url, client_id, tokens))
    }

    pub fn with_tokens(
        http_client: reqwest::Client,
        base_url: &str,
        client_id: ClientId,
        tokens: Arc<TokenCache>,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            tokens,
        }
    }

    /// 認証付きGET。401の場合はトークンを破棄して1回だけ再試行する。
    async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, ApiError> {
        let url = format!("{}/{}", self.base_url, path);

        for attempt in 0..2 {
            let token = self.tokens.access_token().await?;
            let response = self
                .http_client
                .get(&url)
                .header("Client-ID", self.client_id.to_string())
                .bearer_auth(&token)
                .query(query)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                tracing::warn!("🔑 Helix returned 401 for /{} (attempt {})", path, attempt + 1);
                self.tokens.invalidate(&token).await;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::error!("❌ Helix /{} failed with status {}", path, status);
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let envelope: HelixEnvelope<T> = response.json().await?;
            tracing::debug!("📄 Helix /{} returned {} entries", path, envelope.data.len());
            return Ok(envelope.data);
        }

        Err(ApiError::Unauthorized)
    }
}

#[async_trait]
impl LiveDataSource for HelixClient {
    async fn fetch_users(&self, logins: &[String]) -> Result<Vec<UserData>, ApiError> {
        let query: Vec<(&str, &str)> = logins.iter().map(|l| ("login", l.as_str())).collect();
        self.get_data("users", &query).await
    }

    async fn fetch_streams(&self, user_ids: &[String]) -> Result<Vec<StreamData>, ApiError> {
        let mut query: Vec<(&str, &str)> =
            user_ids.iter().map(|id| ("user_id", id.as_str())).collect();
        query.push(("first", STREAMS_PAGE_SIZE));
        self.get_data("streams", &query).await
    }
}
