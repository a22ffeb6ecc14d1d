//! Bot API HTTP client

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{decode_updates, ApiResponse, TelegramError, UpdateBatch, User};
use crate::config::BotConfig;

/// Extra time allowed on top of the long-poll timeout before the HTTP request
/// itself is abandoned
const POLL_GRACE: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct GetUpdatesRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

/// Thin client over the Bot API methods the bot needs.
///
/// No `Debug`: the token is part of every method URL.
pub struct BotClient {
    http: reqwest::Client,
    base_url: String,
    poll_timeout_secs: u64,
}

impl BotClient {
    pub fn new(config: &BotConfig) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TelegramError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: format!("{}/bot{}", config.api_url.trim_end_matches('/'), config.token),
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    /// The bot's own account; a cheap way to check the token works
    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &serde_json::json!({}), SEND_TIMEOUT).await
    }

    /// Long-poll for updates after `offset`.
    ///
    /// Entries that fail to decode are dropped from the batch but still count
    /// towards the next offset.
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<UpdateBatch, TelegramError> {
        let request = GetUpdatesRequest {
            offset,
            timeout: self.poll_timeout_secs,
            allowed_updates: &["message"],
        };
        let timeout = Duration::from_secs(self.poll_timeout_secs) + POLL_GRACE;
        let raw: Vec<serde_json::Value> = self.call("getUpdates", &request, timeout).await?;
        if !raw.is_empty() {
            debug!(count = raw.len(), "Received updates");
        }
        Ok(decode_updates(raw))
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let _: serde_json::Value = self
            .call("sendMessage", &SendMessageRequest { chat_id, text }, SEND_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn call<B, T>(&self, method: &str, body: &B, timeout: Duration) -> Result<T, TelegramError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, method))
            .json(body)
            .timeout(timeout)
            .send()
            .await
            // reqwest errors carry the URL, which includes the token
            .map_err(|e| TelegramError::Network(e.without_url().to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TelegramError::Network(e.without_url().to_string()))?;

        // The API reports most failures as a JSON envelope with a non-2xx status
        match serde_json::from_str::<ApiResponse<T>>(&text) {
            Ok(envelope) => envelope.into_result(),
            Err(_) if !status.is_success() => Err(TelegramError::Http {
                status: status.as_u16(),
                body: text,
            }),
            Err(e) => Err(TelegramError::InvalidResponse(e.to_string())),
        }
    }
}
