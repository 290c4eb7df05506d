pub mod database;
pub mod types;

use std::sync::Arc;
use anyhow::Result;
use tracing::{debug, warn};
use crate::queue::{JobQueue, QUEUE_SMS_SEND};
use crate::sms::database::SMSDatabase;
use crate::sms::types::{
    validate_content, validate_phone_number, IncomingMessage, MessageFilter, MessageStatus,
    OutgoingRequest, SMSMessage, ValidationError
};

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] anyhow::Error)
}

/// Domain service over the message store. All status transitions go through
/// here; the pre-state checks make them safe against concurrent workers.
#[derive(Clone)]
pub struct SMSManager {
    database: Arc<SMSDatabase>,
    queue: JobQueue
}

impl SMSManager {
    pub fn new(database: Arc<SMSDatabase>, queue: JobQueue) -> Self {
        Self { database, queue }
    }

    pub fn borrow_database(&self) -> &Arc<SMSDatabase> {
        &self.database
    }

    /// Accept an outbound message: validate, persist as pending, enqueue a
    /// send job and mark it queued.
    pub async fn create_outgoing(&self, request: OutgoingRequest) -> Result<SMSMessage, SubmitError> {
        validate_phone_number(&request.phone_number)?;
        validate_content(&request.content)?;

        let message = self.database.insert_outgoing(&request).await?;
        self.queue.enqueue(QUEUE_SMS_SEND, &message.message_id).await?;

        if !self.database.transition_status(
            &message.message_id,
            &[MessageStatus::Pending],
            MessageStatus::Queued
        ).await? {
            // The dispatcher got there first; its view wins.
            debug!("Message {} already left pending before queued mark", message.message_id);
        }

        let message = self.database.get_message(&message.message_id).await?
            .unwrap_or(message);
        Ok(message)
    }

    /// Ingest one inbound message. Returns None when the inbox slot was
    /// already stored on an earlier poll.
    pub async fn create_incoming(&self, incoming: IncomingMessage) -> Result<Option<SMSMessage>> {
        self.database.insert_incoming(&incoming).await
    }

    /// Claim a message for sending. False means it is not (or no longer)
    /// actionable, and the caller must drop the job.
    pub async fn mark_sending(&self, message_id: &str) -> Result<bool> {
        self.database.transition_status(
            message_id,
            &[MessageStatus::Pending, MessageStatus::Queued],
            MessageStatus::Sending
        ).await
    }

    pub async fn mark_sent(&self, message_id: &str, modem_message_id: &str) -> Result<bool> {
        self.database.mark_sent(message_id, modem_message_id).await
    }

    /// Compensation for a send attempt that did not reach the modem: the
    /// message returns to queued so the next job attempt can claim it.
    /// Also clears sending marks left behind by a crashed worker.
    pub async fn requeue(&self, message_id: &str) -> Result<bool> {
        self.database.transition_status(
            message_id,
            &[MessageStatus::Sending],
            MessageStatus::Queued
        ).await
    }

    pub async fn mark_delivered(&self, message_id: &str) -> Result<bool> {
        self.database.transition_status(
            message_id,
            &[MessageStatus::Sent],
            MessageStatus::Delivered
        ).await
    }

    /// Terminal failure, reachable from any pre-terminal outgoing state.
    pub async fn mark_failed(&self, message_id: &str, reason: &str) -> Result<bool> {
        let moved = self.database.transition_status(
            message_id,
            &[MessageStatus::Pending, MessageStatus::Queued, MessageStatus::Sending, MessageStatus::Sent],
            MessageStatus::Failed
        ).await?;

        if moved {
            self.database.set_error_message(message_id, reason).await?;
        } else {
            warn!("Refused failed mark for message {} (already terminal)", message_id);
        }
        Ok(moved)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<SMSMessage>> {
        self.database.get_message(message_id).await
    }

    /// Fetch a message as seen by one API key: incoming traffic is shared,
    /// outgoing traffic only shows to its creator.
    pub async fn get_message_for_key(&self, message_id: &str, api_key_id: &str) -> Result<Option<SMSMessage>> {
        let message = match self.database.get_message(message_id).await? {
            Some(message) => message,
            None => return Ok(None)
        };

        let visible = match message.direction {
            types::Direction::Incoming => true,
            types::Direction::Outgoing => message.api_key_id.as_deref() == Some(api_key_id)
        };
        Ok(visible.then_some(message))
    }

    pub async fn list_messages(&self, api_key_id: &str, mut filter: MessageFilter) -> Result<Vec<SMSMessage>> {
        if filter.limit == 0 {
            filter.limit = DEFAULT_LIST_LIMIT;
        }
        filter.limit = filter.limit.min(MAX_LIST_LIMIT);
        self.database.list_messages(api_key_id, &filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sms::types::Direction;

    async fn manager() -> (SMSManager, String) {
        let database = Arc::new(SMSDatabase::connect_in_memory().await.unwrap());
        let queue = JobQueue::new(database.pool().clone());
        let key = database.insert_api_key("test", "hash", "prefix", None).await.unwrap();
        (SMSManager::new(database, queue), key.api_key_id)
    }

    fn request(key: &str) -> OutgoingRequest {
        OutgoingRequest {
            phone_number: "+33612345678".to_string(),
            content: "hi".to_string(),
            api_key_id: key.to_string()
        }
    }

    #[tokio::test]
    async fn test_create_outgoing_enqueues_and_marks_queued() {
        let (manager, key) = manager().await;

        let message = manager.create_outgoing(request(&key)).await.unwrap();
        assert_eq!(message.status, MessageStatus::Queued);

        let job = manager.queue.claim(QUEUE_SMS_SEND).await.unwrap().unwrap();
        assert_eq!(job.message_id, message.message_id);
    }

    #[tokio::test]
    async fn test_create_outgoing_rejects_invalid() {
        let (manager, key) = manager().await;

        let mut too_long = request(&key);
        too_long.content = "a".repeat(161);
        assert!(matches!(
            manager.create_outgoing(too_long).await,
            Err(SubmitError::Validation(ValidationError::ContentTooLong))
        ));

        let mut bad_phone = request(&key);
        bad_phone.phone_number = "not-a-phone".to_string();
        assert!(matches!(
            manager.create_outgoing(bad_phone).await,
            Err(SubmitError::Validation(ValidationError::PhoneFormat))
        ));
    }

    #[tokio::test]
    async fn test_full_delivery_lifecycle() {
        let (manager, key) = manager().await;
        let message = manager.create_outgoing(request(&key)).await.unwrap();
        let id = &message.message_id;

        assert!(manager.mark_sending(id).await.unwrap());
        assert!(manager.mark_sent(id, "M-42").await.unwrap());
        assert!(manager.mark_delivered(id).await.unwrap());

        let done = manager.get_message(id).await.unwrap().unwrap();
        assert_eq!(done.status, MessageStatus::Delivered);
        assert_eq!(done.modem_message_id.as_deref(), Some("M-42"));
        assert!(done.sent_at.is_some());
        assert!(done.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_no_backward_transitions() {
        let (manager, key) = manager().await;
        let message = manager.create_outgoing(request(&key)).await.unwrap();
        let id = &message.message_id;

        manager.mark_sending(id).await.unwrap();
        manager.mark_sent(id, "M-1").await.unwrap();

        // Delivered message cannot be re-sent or re-marked.
        manager.mark_delivered(id).await.unwrap();
        assert!(!manager.mark_sending(id).await.unwrap());
        assert!(!manager.mark_sent(id, "M-2").await.unwrap());
        assert!(!manager.mark_failed(id, "too late").await.unwrap());

        let done = manager.get_message(id).await.unwrap().unwrap();
        assert_eq!(done.status, MessageStatus::Delivered);
        assert_eq!(done.modem_message_id.as_deref(), Some("M-1"));
        assert!(done.error_message.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_sending_claim_single_winner() {
        let (manager, key) = manager().await;
        let message = manager.create_outgoing(request(&key)).await.unwrap();

        let first = manager.mark_sending(&message.message_id).await.unwrap();
        let second = manager.mark_sending(&message.message_id).await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_mark_failed_sets_reason() {
        let (manager, key) = manager().await;
        let message = manager.create_outgoing(request(&key)).await.unwrap();

        manager.mark_sending(&message.message_id).await.unwrap();
        assert!(manager.mark_failed(&message.message_id, "Invalid phone number (117)").await.unwrap());

        let failed = manager.get_message(&message.message_id).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("Invalid phone number (117)"));
    }

    #[tokio::test]
    async fn test_ownership_scoping() {
        let (manager, key) = manager().await;
        let other = manager.borrow_database()
            .insert_api_key("other", "hash2", "prefix2", None).await.unwrap();

        let message = manager.create_outgoing(request(&key)).await.unwrap();

        assert!(manager.get_message_for_key(&message.message_id, &key).await.unwrap().is_some());
        assert!(manager.get_message_for_key(&message.message_id, &other.api_key_id).await.unwrap().is_none());

        let incoming = manager.create_incoming(IncomingMessage {
            phone_number: "+33611111111".to_string(),
            content: "in".to_string(),
            modem_index: 3,
            modem_reported_status: None
        }).await.unwrap().unwrap();
        assert_eq!(incoming.direction, Direction::Incoming);

        // Incoming messages are visible to every key.
        assert!(manager.get_message_for_key(&incoming.message_id, &other.api_key_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_limit_clamped() {
        let (manager, key) = manager().await;
        let listed = manager.list_messages(&key, MessageFilter {
            limit: 10_000,
            ..Default::default()
        }).await.unwrap();
        assert!(listed.is_empty());
    }
}
