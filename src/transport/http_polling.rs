//! The always-available transport: messages are persisted to the downlink
//! table and handed out when the recipient drains its long-poll. Delivery is
//! at-least-once; a message is only removed once a drain returns it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::model::DownlinkMessage;
use crate::repo::{RepoResult, Repository};
use crate::transport::{DownlinkWaiters, TransportError};

pub struct HttpPollingTransport {
    repo: Repository,
    waiters: Arc<DownlinkWaiters>,
}

impl HttpPollingTransport {
    pub fn new(repo: Repository, waiters: Arc<DownlinkWaiters>) -> Self {
        Self { repo, waiters }
    }

    pub async fn start(&self, _shutdown: CancellationToken) -> Result<(), TransportError> {
        Ok(())
    }

    pub async fn stop(&self) {}

    pub fn can_send(&self, _recipient: &str) -> bool {
        true
    }

    pub async fn send(&self, msg: DownlinkMessage) -> Result<(), TransportError> {
        let recipient = msg.recipient_id.clone();
        self.repo.downlink_enqueue(msg).await?;
        self.waiters.notify(&recipient);
        Ok(())
    }

    /// Drain messages for a recipient, blocking up to `wait`. Returns empty
    /// on deadline. Dropping the returned future (peer disconnect) before a
    /// drain completes consumes nothing.
    pub async fn wait_for_messages(
        &self,
        recipient: &str,
        max: usize,
        wait: Duration,
    ) -> RepoResult<Vec<DownlinkMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Grab the waiter before checking the queue so an enqueue that
            // lands in between leaves a stored permit.
            let waiter = self.waiters.waiter(recipient);
            let notified = waiter.notified();

            let messages = self.repo.downlink_drain(recipient, max, Utc::now()).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }
}
