use std::time::Duration;
use anyhow::Result;
use futures::{stream, StreamExt};
use tokio::time::interval;
use tracing::{debug, info, warn};
use crate::modem::error::ModemError;
use crate::modem::protocol::DeliveryState;
use crate::modem::ModemClient;
use crate::sms::types::SMSMessage;
use crate::sms::SMSManager;

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// Leave freshly sent messages alone; most deliver within the first poll
/// gap and asking the modem earlier is wasted budget.
const MIN_SENT_AGE_SECS: i64 = 300;

const CONCURRENCY_LIMIT: usize = 3;
const BATCH_LIMIT: u32 = 100;

const DELIVERY_FAILED_REASON: &str = "Delivery failed (modem reported)";

/// Periodic sweep that moves sent messages to their terminal state based on
/// the modem's delivery reports.
pub struct StatusReconciler {
    manager: SMSManager,
    modem: ModemClient,
    sweep_interval: Duration,
    min_sent_age_secs: i64
}

impl StatusReconciler {
    pub fn new(manager: SMSManager, modem: ModemClient) -> Self {
        Self::with_settings(manager, modem, RECONCILE_INTERVAL, MIN_SENT_AGE_SECS)
    }

    pub fn with_settings(
        manager: SMSManager,
        modem: ModemClient,
        sweep_interval: Duration,
        min_sent_age_secs: i64
    ) -> Self {
        Self {
            manager,
            modem,
            sweep_interval,
            min_sent_age_secs
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.sweep_interval);
        info!("StatusReconciler started (every {:?})", self.sweep_interval);

        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile_once().await {
                warn!("Delivery status sweep failed: {:?}", e);
            }
        }
    }

    pub async fn reconcile_once(&self) -> Result<usize> {
        let due = self.manager.borrow_database()
            .get_unreconciled_sent(self.min_sent_age_secs, BATCH_LIMIT)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }
        debug!("Reconciling delivery status for {} messages", due.len());

        let mut updated = 0;
        let mut lookups = stream::iter(due)
            .map(|message| self.reconcile_message(message))
            .buffer_unordered(CONCURRENCY_LIMIT);

        while let Some(result) = lookups.next().await {
            match result {
                Ok(true) => updated += 1,
                Ok(false) => {},

                // Open breaker: the whole cycle is pointless, try again on
                // the next tick.
                Err(ModemError::CircuitOpen) => {
                    debug!("Circuit open, abandoning delivery status sweep");
                    break;
                },
                Err(e) => warn!("Delivery status lookup failed: {:?}", e)
            }
        }

        Ok(updated)
    }

    async fn reconcile_message(&self, message: SMSMessage) -> Result<bool, ModemError> {
        let modem_message_id = match message.modem_message_id.as_deref() {
            Some(id) => id,
            None => return Ok(false)
        };

        let state = self.modem.get_status(modem_message_id).await?;
        let updated = match state {
            DeliveryState::Delivered => {
                self.manager.mark_delivered(&message.message_id)
                    .await
                    .map_err(|e| ModemError::Transport(e.to_string()))?
            },
            DeliveryState::Failed => {
                self.manager.mark_failed(&message.message_id, DELIVERY_FAILED_REASON)
                    .await
                    .map_err(|e| ModemError::Transport(e.to_string()))?
            },

            // Still in flight (or firmware being vague): next sweep retries.
            DeliveryState::Pending | DeliveryState::Sent | DeliveryState::Unknown => false
        };

        if updated {
            info!(
                "Message {} reconciled to {}",
                message.message_id,
                if state == DeliveryState::Delivered { "delivered" } else { "failed" }
            );
        }
        Ok(updated)
    }
}
