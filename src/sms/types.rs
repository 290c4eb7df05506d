use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const MAX_PHONE_LENGTH: usize = 20;
pub const MAX_CONTENT_LENGTH: usize = 160;

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct SMSMessage {
    pub message_id: String,
    pub direction: Direction,
    pub phone_number: String,
    pub content: String,
    pub status: MessageStatus,
    pub modem_message_id: Option<String>,
    pub error_message: Option<String>,
    pub api_key_id: Option<String>,
    pub modem_index: Option<i64>,
    pub modem_reported_status: Option<String>,
    pub sent_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub received_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming
}
impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming"
        }
    }
}
impl TryFrom<&str> for Direction {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "outgoing" => Ok(Direction::Outgoing),
            "incoming" => Ok(Direction::Incoming),
            other => Err(anyhow!("Invalid message direction: {}", other))
        }
    }
}

/// Outgoing lifecycle: Pending -> Queued -> Sending -> Sent -> Delivered | Failed.
/// Failed is also reachable from Queued/Sending on non-retryable errors.
/// Incoming messages are created directly as Received.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[repr(i64)]
pub enum MessageStatus {
    Pending = 0,
    Queued = 1,
    Sending = 2,
    Sent = 3,
    Delivered = 4,
    Failed = 5,
    Received = 6
}
impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received"
        }
    }

    /// A send worker must refuse to act on anything else.
    pub fn is_send_actionable(&self) -> bool {
        matches!(self, MessageStatus::Pending | MessageStatus::Queued | MessageStatus::Sending)
    }
}
impl From<&MessageStatus> for u8 {
    fn from(status: &MessageStatus) -> Self {
        match status {
            MessageStatus::Pending => 0,
            MessageStatus::Queued => 1,
            MessageStatus::Sending => 2,
            MessageStatus::Sent => 3,
            MessageStatus::Delivered => 4,
            MessageStatus::Failed => 5,
            MessageStatus::Received => 6
        }
    }
}
impl TryFrom<u8> for MessageStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageStatus::Pending),
            1 => Ok(MessageStatus::Queued),
            2 => Ok(MessageStatus::Sending),
            3 => Ok(MessageStatus::Sent),
            4 => Ok(MessageStatus::Delivered),
            5 => Ok(MessageStatus::Failed),
            6 => Ok(MessageStatus::Received),
            _ => Err(anyhow!("Invalid message status value: {}", value))
        }
    }
}
impl TryFrom<&str> for MessageStatus {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(MessageStatus::Pending),
            "queued" => Ok(MessageStatus::Queued),
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            "received" => Ok(MessageStatus::Received),
            other => Err(anyhow!("Invalid message status: {}", other))
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub phone_number: String,
    pub content: String,
    pub api_key_id: String
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub phone_number: String,
    pub content: String,
    pub modem_index: i64,
    pub modem_reported_status: Option<String>
}

#[derive(Debug, Default, Clone)]
pub struct MessageFilter {
    pub direction: Option<Direction>,
    pub status: Option<MessageStatus>,
    pub phone_number: Option<String>,
    pub limit: u32,
    pub offset: u32
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Phone number is required")]
    MissingPhone,

    #[error("Phone number exceeds {MAX_PHONE_LENGTH} characters")]
    PhoneTooLong,

    #[error("Phone number must contain only digits with an optional leading '+'")]
    PhoneFormat,

    #[error("Message content is required")]
    MissingContent,

    #[error("Message content exceeds {MAX_CONTENT_LENGTH} characters")]
    ContentTooLong
}

pub fn validate_phone_number(phone: &str) -> Result<(), ValidationError> {
    if phone.is_empty() {
        return Err(ValidationError::MissingPhone);
    }
    if phone.len() > MAX_PHONE_LENGTH {
        return Err(ValidationError::PhoneTooLong);
    }

    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::PhoneFormat);
    }
    Ok(())
}

/// Content length is counted in characters, not bytes. A single GSM segment
/// carries 160 of them and segmentation is unsupported.
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.is_empty() {
        return Err(ValidationError::MissingContent);
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(ValidationError::ContentTooLong);
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct ApiKey {
    pub api_key_id: String,
    pub name: String,

    #[serde(skip_serializing)]
    pub key_hash: String,

    pub key_prefix: String,
    pub is_active: bool,
    pub rate_limit: Option<i64>,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64
}
impl ApiKey {
    pub fn effective_rate_limit(&self, default_limit: u32) -> u32 {
        self.rate_limit
            .filter(|limit| *limit > 0)
            .map(|limit| limit as u32)
            .unwrap_or(default_limit)
    }
}
