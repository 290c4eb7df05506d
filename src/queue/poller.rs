use std::time::Duration;
use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{debug, info, warn};
use crate::modem::protocol::DEFAULT_INBOX_BOX_TYPE;
use crate::modem::ModemClient;
use crate::sms::types::IncomingMessage;
use crate::sms::SMSManager;

/// Periodic inbox scan. The cursor (highest inbox index already ingested)
/// lives in the gateway_state table so a restart re-polls at most one
/// window, and the unique modem_index constraint swallows the overlap.
pub struct InboxPoller {
    manager: SMSManager,
    modem: ModemClient,
    poll_interval: Duration
}

impl InboxPoller {
    pub fn new(manager: SMSManager, modem: ModemClient, poll_interval: Duration) -> Self {
        Self {
            manager,
            modem,
            poll_interval
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.poll_interval);
        info!("InboxPoller started (every {:?})", self.poll_interval);

        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(0) => {},
                Ok(stored) => info!("Stored {} new inbound messages", stored),
                Err(e) => warn!("Inbox poll failed: {:?}", e)
            }
        }
    }

    /// One scan: list the inbox, keep entries beyond the cursor, persist
    /// them, then advance the cursor. The cursor only moves after the whole
    /// batch inserted.
    pub async fn poll_once(&self) -> Result<usize> {
        let inbox = self.modem.list_inbox(DEFAULT_INBOX_BOX_TYPE)
            .await
            .context("Failed to list modem inbox")?;

        let cursor = self.manager.borrow_database().get_inbox_cursor().await?;
        let fresh: Vec<_> = inbox.into_iter()
            .filter(|entry| entry.index > cursor)
            .collect();

        if fresh.is_empty() {
            debug!("Inbox poll: nothing new beyond index {}", cursor);
            return Ok(0);
        }

        let max_index = fresh.iter()
            .map(|entry| entry.index)
            .max()
            .unwrap_or(cursor);

        let mut stored = 0;
        for entry in fresh {
            let incoming = IncomingMessage {
                phone_number: entry.phone,
                content: entry.content,
                modem_index: entry.index,
                modem_reported_status: (!entry.status.is_empty()).then(|| entry.status)
            };

            match self.manager.create_incoming(incoming).await? {
                Some(message) => {
                    debug!("Stored inbound message {} (inbox slot {})", message.message_id, entry.index);
                    stored += 1;
                },
                None => debug!("Inbox slot {} already ingested", entry.index)
            }
        }

        self.manager.borrow_database().set_inbox_cursor(max_index).await?;
        Ok(stored)
    }
}
