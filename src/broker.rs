//! Session broker client.
//!
//! The broker hands out short-lived call credentials and, once the local
//! user is in the call, dispatches the voice agent into the same room.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;

use crate::error::BrokerError;

/// Room URL and join token issued by the broker.
#[derive(Clone, PartialEq)]
pub struct CallCredentials {
    pub room_url: String,
    pub token: String,
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCredentials")
            .field("room_url", &self.room_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Acknowledgment of an agent dispatch. The broker's body is otherwise opaque.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentDispatch {
    pub room_url: Option<String>,
    pub bot_pids: Vec<u32>,
}

#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// `GET /get_daily_url_token`
    async fn fetch_credentials(&self) -> Result<CallCredentials, BrokerError>;

    /// `POST /connect`
    async fn request_agent(&self, credentials: &CallCredentials) -> Result<AgentDispatch, BrokerError>;
}

#[derive(Deserialize)]
struct UrlTokenResponse {
    daily_url: Option<String>,
    daily_token: Option<String>,
}

pub struct BrokerClient {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl BrokerClient {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check_status(response: Response) -> Result<Response, BrokerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        log::warn!("Broker responded {}: {}", status, body);
        Err(BrokerError::Status {
            status: status.as_u16(),
            text: status.canonical_reason().unwrap_or("").to_string(),
        })
    }
}

#[async_trait]
impl SessionBroker for BrokerClient {
    async fn fetch_credentials(&self) -> Result<CallCredentials, BrokerError> {
        let url = self.url("get_daily_url_token");
        log::info!("Requesting call credentials from {}", url);

        let request = self
            .http
            .get(&url)
            .header("Content-Type", "application/json");
        let response = Self::check_status(self.with_auth(request).send().await?).await?;

        let body: UrlTokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Decode(e.to_string()))?;

        match (body.daily_url, body.daily_token) {
            (Some(room_url), Some(token)) if !room_url.is_empty() && !token.is_empty() => {
                log::info!("Received credentials for room {}", room_url);
                Ok(CallCredentials { room_url, token })
            }
            _ => Err(BrokerError::MissingCredentials),
        }
    }

    async fn request_agent(&self, credentials: &CallCredentials) -> Result<AgentDispatch, BrokerError> {
        let url = self.url("connect");
        log::info!("Dispatching agent to room {}", credentials.room_url);

        let body = json!({
            "daily_room_url": credentials.room_url,
            "daily_token": credentials.token,
        });
        let request = self.http.post(&url).json(&body);
        let response = Self::check_status(self.with_auth(request).send().await?).await?;

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(AgentDispatch::default());
        }
        // 响应体不是约定格式时视为普通确认
        Ok(serde_json::from_str(&text).unwrap_or_else(|e| {
            log::debug!("Unrecognised dispatch acknowledgment ({}): {}", e, text);
            AgentDispatch::default()
        }))
    }
}
