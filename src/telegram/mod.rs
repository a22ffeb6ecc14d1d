//! Telegram Bot API transport
//!
//! Long-polls `getUpdates`, hands `/start` commands to the issuer and sends
//! the reply back to the originating chat.

pub mod client;
pub mod dispatch;
pub mod poller;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use client::BotClient;
pub use dispatch::{handle_update, is_start_command, ChatTransport, UpdateSource};
pub use poller::Poller;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Bot API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Envelope every Bot API method answers with
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
}

impl<T> ApiResponse<T> {
    pub fn into_result(self) -> Result<T, TelegramError> {
        if !self.ok {
            return Err(TelegramError::Api {
                code: self.error_code.unwrap_or(0),
                description: self.description.unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
        self.result
            .ok_or_else(|| TelegramError::InvalidResponse("ok response without result".into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// One `getUpdates` result.
///
/// `last_update_id` covers every entry the API returned, including ones that
/// could not be decoded, so the next poll acknowledges them too.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    pub updates: Vec<Update>,
    pub last_update_id: Option<i64>,
}

impl UpdateBatch {
    /// Offset for the next `getUpdates` call, if this batch moved it
    pub fn next_offset(&self) -> Option<i64> {
        self.last_update_id.map(|id| id + 1)
    }
}

/// Decode each update on its own so one bad entry cannot stall the batch
pub fn decode_updates(raw: Vec<serde_json::Value>) -> UpdateBatch {
    let mut batch = UpdateBatch::default();
    for value in raw {
        let update_id = value.get("update_id").and_then(serde_json::Value::as_i64);
        if let Some(id) = update_id {
            batch.last_update_id = Some(batch.last_update_id.map_or(id, |last| last.max(id)));
        }
        match serde_json::from_value::<Update>(value) {
            Ok(update) => batch.updates.push(update),
            Err(e) => warn!(?update_id, error = %e, "Skipping undecodable update"),
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_get_updates() {
        let body = r#"{
            "ok": true,
            "result": [
                {"update_id": 10, "message": {
                    "message_id": 1,
                    "from": {"id": 42, "is_bot": false, "first_name": "Ann"},
                    "chat": {"id": 4200, "type": "private"},
                    "date": 1700000000,
                    "text": "/start"
                }},
                {"update_id": 11, "edited_message": {"message_id": 1}}
            ]
        }"#;

        let response: ApiResponse<Vec<Update>> = serde_json::from_str(body).unwrap();
        let updates = response.into_result().unwrap();
        assert_eq!(updates.len(), 2);

        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.from.as_ref().unwrap().id, 42);
        assert_eq!(message.chat.id, 4200);
        assert_eq!(message.text.as_deref(), Some("/start"));
        assert!(updates[1].message.is_none());
    }

    #[test]
    fn test_undecodable_update_is_skipped_but_acknowledged() {
        let body = r#"{
            "ok": true,
            "result": [
                {"update_id": 20, "message": {
                    "message_id": 1,
                    "from": {"id": 42},
                    "chat": {"id": 4200},
                    "text": "/start"
                }},
                {"update_id": 21, "message": {"message_id": "not a number"}},
                {"update_id": 22, "message": {
                    "message_id": 3,
                    "from": {"id": 43},
                    "chat": {"id": 4300},
                    "text": "/start"
                }}
            ]
        }"#;

        let response: ApiResponse<Vec<serde_json::Value>> = serde_json::from_str(body).unwrap();
        let batch = decode_updates(response.into_result().unwrap());

        let ids: Vec<i64> = batch.updates.iter().map(|u| u.update_id).collect();
        assert_eq!(ids, vec![20, 22]);
        assert_eq!(batch.last_update_id, Some(22));
        assert_eq!(batch.next_offset(), Some(23));
    }

    #[test]
    fn test_bad_last_update_still_moves_offset() {
        let raw = vec![
            serde_json::json!({"update_id": 5}),
            serde_json::json!({"update_id": 6, "message": {"chat": {}}}),
        ];
        let batch = decode_updates(raw);
        assert_eq!(batch.updates.len(), 1);
        assert_eq!(batch.next_offset(), Some(7));

        assert_eq!(decode_updates(Vec::new()).next_offset(), None);
    }

    #[test]
    fn test_api_error_envelope() {
        let body = r#"{"ok": false, "error_code": 401, "description": "Unauthorized"}"#;
        let response: ApiResponse<Vec<Update>> = serde_json::from_str(body).unwrap();
        match response.into_result() {
            Err(TelegramError::Api { code, description }) => {
                assert_eq!(code, 401);
                assert_eq!(description, "Unauthorized");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }
}
