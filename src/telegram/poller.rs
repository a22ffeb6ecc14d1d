//! Long-polling receive loop

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use super::{handle_update, ChatTransport, UpdateSource};
use crate::issuer::KeyIssuer;

/// Pulls updates from the Bot API and spawns one task per update
pub struct Poller<C> {
    client: Arc<C>,
    issuer: Arc<KeyIssuer>,
    retry_delay: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl<C> Poller<C>
where
    C: UpdateSource + ChatTransport + 'static,
{
    pub fn new(
        client: Arc<C>,
        issuer: Arc<KeyIssuer>,
        retry_delay: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            client,
            issuer,
            retry_delay,
            shutdown,
        }
    }

    /// Run until a shutdown signal arrives.
    ///
    /// Returns only after every spawned update handler has finished, so a key
    /// that was stored is also sent.
    pub async fn run(mut self) {
        info!("Receive loop started");
        let mut offset: Option<i64> = None;
        let mut handlers = JoinSet::new();

        loop {
            while let Some(Some(joined)) = handlers.join_next().now_or_never() {
                log_handler_exit(joined);
            }

            let result = tokio::select! {
                _ = self.shutdown.recv() => break,
                result = self.client.get_updates(offset) => result,
            };

            match result {
                Ok(batch) => {
                    if let Some(next) = batch.next_offset() {
                        offset = Some(next);
                    }
                    for update in batch.updates {
                        let client = Arc::clone(&self.client);
                        let issuer = Arc::clone(&self.issuer);
                        handlers.spawn(async move {
                            let update_id = update.update_id;
                            if let Err(e) = handle_update(client.as_ref(), &issuer, update).await {
                                warn!(update_id, error = %e, "Failed to send reply");
                            }
                        });
                    }
                }
                Err(e) => {
                    error!(error = %e, "Polling for updates failed");
                    tokio::select! {
                        _ = self.shutdown.recv() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }

        if !handlers.is_empty() {
            info!(pending = handlers.len(), "Waiting for update handlers");
        }
        while let Some(joined) = handlers.join_next().await {
            log_handler_exit(joined);
        }

        info!("Receive loop stopped");
    }
}

fn log_handler_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Update handler panicked");
    }
}
