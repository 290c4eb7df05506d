use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use crate::modem::error::ModemError;

pub const DEFAULT_INBOX_BOX_TYPE: i32 = 1;
pub const INBOX_READ_COUNT: u32 = 50;

/// Longest message id this gateway will accept from the modem.
pub const MAX_MESSAGE_ID_LENGTH: usize = 50;

/// Handshake response from /api/webserver/SesTokInfo.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename = "response")]
pub struct SesTokInfo {
    #[serde(rename = "SesInfo")]
    pub session_id: String,

    #[serde(rename = "TokInfo")]
    pub token: String
}

/// Application-level error document. Firmware reports failures as a
/// well-formed `<error>` body with a numeric code.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename = "error")]
pub struct ModemErrorResponse {
    pub code: i32,

    #[serde(default)]
    pub message: String
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Phones {
    #[serde(rename = "Phone")]
    pub phone: Vec<String>
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename = "request")]
pub struct SendSmsRequest {
    #[serde(rename = "Index")]
    pub index: i32,

    #[serde(rename = "Phones")]
    pub phones: Phones,

    #[serde(rename = "Sca")]
    pub sca: String,

    #[serde(rename = "Content")]
    pub content: String,

    #[serde(rename = "Length")]
    pub length: usize,

    #[serde(rename = "Reserved")]
    pub reserved: i32,

    #[serde(rename = "Date")]
    pub date: String
}
impl SendSmsRequest {
    pub fn new(phone: &str, content: &str, date: String) -> Self {
        Self {
            index: -1,
            phones: Phones {
                phone: vec![phone.to_string()]
            },
            sca: String::new(),
            content: content.to_string(),
            length: content.chars().count(),
            reserved: 1,
            date
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename = "response")]
pub struct SendSmsResponse {
    pub message_id: String
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename = "request")]
pub struct SmsListRequest {
    #[serde(rename = "PageIndex")]
    pub page_index: i32,

    #[serde(rename = "ReadCount")]
    pub read_count: u32,

    #[serde(rename = "BoxType")]
    pub box_type: i32,

    #[serde(rename = "SortType")]
    pub sort_type: i32,

    #[serde(rename = "Ascending")]
    pub ascending: i32,

    #[serde(rename = "UnreadPreferred")]
    pub unread_preferred: i32
}
impl SmsListRequest {
    pub fn inbox(box_type: i32) -> Self {
        Self {
            page_index: 1,
            read_count: INBOX_READ_COUNT,
            box_type,
            sort_type: 0,
            ascending: 1,
            unread_preferred: 0
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename = "response")]
pub struct SmsListResponse {
    pub messages: InboxMessages
}

#[derive(Debug, Deserialize, PartialEq, Default)]
pub struct InboxMessages {
    #[serde(rename = "message", default)]
    pub message: Vec<InboxMessage>
}

/// One inbox slot as reported by the modem.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct InboxMessage {
    pub index: i64,
    pub phone: String,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub date: String,

    #[serde(default)]
    pub status: String
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename = "request")]
pub struct SmsStatusRequest {
    #[serde(rename = "MessageId")]
    pub message_id: String
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename = "response")]
pub struct SmsStatusResponse {
    pub status: String
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename = "response")]
pub struct ModemHealthResponse {
    pub signal_strength: u8,
    pub network_type: String,
    pub network_name: String,
    pub battery_level: u8,
    pub connection_status: String
}

/// Delivery state reported by the modem for an already-sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Failed,
    Unknown
}
impl DeliveryState {
    /// Case-insensitive mapping; anything unrecognized is Unknown rather
    /// than an error, firmware wording varies.
    pub fn from_report(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => DeliveryState::Pending,
            "sent" => DeliveryState::Sent,
            "delivered" => DeliveryState::Delivered,
            "failed" => DeliveryState::Failed,
            _ => DeliveryState::Unknown
        }
    }
}

pub fn serialize_request<T: Serialize>(request: &T) -> Result<String, ModemError> {
    let body = to_string(request)
        .map_err(|e| ModemError::Parse(format!("Failed to serialize request: {}", e)))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", body))
}

/// Parse a response body, falling back to the `<error>` document when the
/// expected shape does not match.
pub fn parse_response<'de, T: Deserialize<'de>>(body: &'de str) -> Result<T, ModemError> {
    match from_str::<T>(body) {
        Ok(parsed) => Ok(parsed),
        Err(parse_err) => match from_str::<ModemErrorResponse>(body) {
            Ok(error) => Err(ModemError::ModemCode {
                code: error.code,
                message: (!error.message.is_empty()).then(|| error.message)
            }),
            Err(_) => Err(ModemError::Parse(format!(
                "Unexpected modem response: {} ({})",
                truncate_for_log(body), parse_err
            )))
        }
    }
}

fn truncate_for_log(body: &str) -> &str {
    let end = body.char_indices()
        .nth(200)
        .map(|(idx, _)| idx)
        .unwrap_or(body.len());
    &body[..end]
}
