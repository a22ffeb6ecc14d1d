//! Routing of a single update to the issuer

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{BotClient, TelegramError, Update, UpdateBatch};
use crate::issuer::{KeyIssuer, FAILURE_REPLY};

const START_COMMAND: &str = "/start";

/// Where replies go
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TelegramError>;
}

#[async_trait]
impl ChatTransport for BotClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        self.send_message(chat_id, text).await
    }
}

/// Where updates come from
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn get_updates(&self, offset: Option<i64>) -> Result<UpdateBatch, TelegramError>;
}

#[async_trait]
impl UpdateSource for BotClient {
    async fn get_updates(&self, offset: Option<i64>) -> Result<UpdateBatch, TelegramError> {
        BotClient::get_updates(self, offset).await
    }
}

pub fn is_start_command(text: &str) -> bool {
    text.eq_ignore_ascii_case(START_COMMAND)
}

/// Handle one update: log text messages and answer `/start`.
///
/// Storage failures are logged and answered with a generic failure message;
/// only a failed reply is returned as an error.
pub async fn handle_update<T>(
    transport: &T,
    issuer: &KeyIssuer,
    update: Update,
) -> Result<(), TelegramError>
where
    T: ChatTransport + ?Sized,
{
    let Some(message) = update.message else {
        return Ok(());
    };
    let Some(text) = message.text.as_deref() else {
        return Ok(());
    };

    info!(chat_id = message.chat.id, text, "Received message");

    if !is_start_command(text) {
        return Ok(());
    }

    let Some(from) = message.from.as_ref() else {
        warn!(chat_id = message.chat.id, "Start command without a sender, ignoring");
        return Ok(());
    };

    let reply = match issuer.handle_start_command(from.id).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(user_id = from.id, error = %e, "Key issuance failed");
            FAILURE_REPLY.to_string()
        }
    };

    transport.send_text(message.chat.id, &reply).await
}
