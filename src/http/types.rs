use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use tracing::error;
use crate::auth::rate_limit::RateLimitDecision;
use crate::modem::ModemHealth;
use crate::sms::types::SMSMessage;

/// Authenticated key identity, injected by the auth middleware.
#[derive(Clone)]
pub struct AuthContext {
    pub api_key_id: String
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub phone: String,
    pub content: String
}

#[derive(Deserialize, Default)]
pub struct ListMessagesQuery {
    pub direction: Option<String>,
    pub status: Option<String>,
    pub phone: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub id: String,
    pub direction: &'static str,
    pub phone: String,
    pub content: String,
    pub status: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub modem_message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,

    pub inserted_at: String,
    pub updated_at: String
}
impl From<SMSMessage> for MessageResponse {
    fn from(message: SMSMessage) -> Self {
        Self {
            id: message.message_id,
            direction: message.direction.as_str(),
            phone: message.phone_number,
            content: message.content,
            status: message.status.as_str(),
            modem_message_id: message.modem_message_id,
            error_message: message.error_message,
            sent_at: message.sent_at.map(format_timestamp),
            delivered_at: message.delivered_at.map(format_timestamp),
            received_at: message.received_at.map(format_timestamp),
            inserted_at: format_timestamp(message.created_at),
            updated_at: format_timestamp(message.updated_at)
        }
    }
}

fn format_timestamp(epoch_secs: i64) -> String {
    DateTime::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub modem: ModemHealthStatus,
    pub queue: QueueStatus
}

#[derive(Serialize)]
pub struct ModemHealthStatus {
    pub healthy: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known: Option<ModemHealth>
}

#[derive(Serialize)]
pub struct QueueStatus {
    pub paused: bool,
    pub pending: i64
}

#[derive(Debug)]
pub enum ApiError {
    MissingApiKey,
    InvalidApiKey,
    RateLimited(RateLimitDecision),
    Validation(String),
    NotFound,
    ModemUnavailable,
    Internal(anyhow::Error)
}
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::MissingApiKey => (StatusCode::UNAUTHORIZED, "Missing API key".to_string()),
            ApiError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "Invalid API key".to_string()),
            ApiError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded".to_string()),
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Message not found".to_string()),
            ApiError::ModemUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "Modem unavailable".to_string()),
            ApiError::Internal(e) => {
                // Raw store/queue errors never reach API callers.
                error!("Internal error serving request: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let mut response = (status, Json(ErrorResponse { error: message })).into_response();
        if let ApiError::RateLimited(decision) = self {
            apply_rate_limit_headers(response.headers_mut(), &decision);
        }
        response
    }
}

pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.to_string())
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sms::types::{Direction, MessageStatus};

    fn message() -> SMSMessage {
        SMSMessage {
            message_id: "id-1".to_string(),
            direction: Direction::Outgoing,
            phone_number: "+33612345678".to_string(),
            content: "hi".to_string(),
            status: MessageStatus::Sent,
            modem_message_id: Some("M-42".to_string()),
            error_message: None,
            api_key_id: Some("key-1".to_string()),
            modem_index: None,
            modem_reported_status: None,
            sent_at: Some(1_767_225_600),
            delivered_at: None,
            received_at: None,
            created_at: 1_767_225_000,
            updated_at: 1_767_225_600
        }
    }

    #[test]
    fn test_message_response_shape() {
        let response = MessageResponse::from(message());
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["id"], "id-1");
        assert_eq!(json["direction"], "outgoing");
        assert_eq!(json["phone"], "+33612345678");
        assert_eq!(json["status"], "sent");
        assert_eq!(json["modemMessageId"], "M-42");

        // Nulls are omitted entirely.
        assert!(json.get("errorMessage").is_none());
        assert!(json.get("deliveredAt").is_none());

        // Timestamps render as ISO 8601 UTC.
        let sent_at = json["sentAt"].as_str().unwrap();
        assert!(sent_at.ends_with('Z'), "expected UTC suffix, got {}", sent_at);
        assert!(sent_at.starts_with("2026-01-01T00:00:00"));
    }

    #[test]
    fn test_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &RateLimitDecision {
            allowed: true,
            limit: 100,
            remaining: 42,
            reset_at: 1_767_229_200
        });

        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "42");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "1767229200");
    }
}
