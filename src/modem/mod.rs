pub mod breaker;
pub mod error;
pub mod protocol;
pub mod session;

use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};
use crate::config::ModemConfig;
use crate::modem::breaker::CircuitBreaker;
use crate::modem::error::ModemError;
use crate::modem::protocol::{
    DeliveryState, InboxMessage, ModemHealthResponse, SendSmsRequest, SendSmsResponse,
    SesTokInfo, SmsListRequest, SmsListResponse, SmsStatusRequest, SmsStatusResponse
};
use crate::modem::session::{SessionCache, SessionToken};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Session/token error codes; the cached pair is stale, not the modem dead.
const TOKEN_ERROR_CODES: [i32; 3] = [125001, 125002, 125003];

/// Snapshot returned by `health_check`.
#[derive(Debug, Clone, Serialize)]
pub struct ModemHealth {
    pub signal_strength: u8,
    pub network_type: String,
    pub network_name: String,
    pub battery_level: u8,
    pub connection_status: String
}
impl From<ModemHealthResponse> for ModemHealth {
    fn from(response: ModemHealthResponse) -> Self {
        Self {
            signal_strength: response.signal_strength,
            network_type: response.network_type,
            network_name: response.network_name,
            battery_level: response.battery_level,
            connection_status: response.connection_status
        }
    }
}

/// Client for the modem's HiLink HTTP interface. Every wire call runs
/// behind the shared circuit breaker; the session pair is cached with a
/// 5-minute TTL and refreshed on expiry or token errors.
#[derive(Clone)]
pub struct ModemClient {
    http: Client,
    base_url: String,
    host_header: String,
    session: SessionCache,
    breaker: CircuitBreaker
}

impl ModemClient {
    pub fn new(config: &ModemConfig, breaker: CircuitBreaker) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let parsed = reqwest::Url::parse(&base_url)
            .with_context(|| format!("Invalid modem base url: {}", base_url))?;

        // Some firmware variants reject requests without an explicit Host.
        let host = parsed.host_str()
            .with_context(|| format!("Modem base url has no host: {}", base_url))?;
        let host_header = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string()
        };

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build modem HTTP client")?;

        Ok(Self {
            http,
            base_url,
            host_header,
            session: SessionCache::new(),
            breaker
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Submit a single-segment SMS. Returns the modem-assigned message id.
    pub async fn send_sms(&self, phone: &str, content: &str) -> Result<String, ModemError> {
        self.breaker.check().map_err(|_| ModemError::CircuitOpen)?;

        let date = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let request = SendSmsRequest::new(phone, content, date);

        let result = self.post_xml::<_, SendSmsResponse>("/api/sms/send-sms", &request).await;
        let result = result.and_then(|response| {
            if response.message_id.is_empty() {
                Err(ModemError::Parse("Empty message_id in send response".to_string()))
            } else if response.message_id.chars().count() > protocol::MAX_MESSAGE_ID_LENGTH {
                Err(ModemError::Parse(format!(
                    "Oversized message_id in send response ({} chars)",
                    response.message_id.chars().count()
                )))
            } else {
                Ok(response.message_id)
            }
        });
        self.account(&result);
        result
    }

    /// List the modem inbox, ordered by slot index ascending.
    pub async fn list_inbox(&self, box_type: i32) -> Result<Vec<InboxMessage>, ModemError> {
        self.breaker.check().map_err(|_| ModemError::CircuitOpen)?;

        let request = SmsListRequest::inbox(box_type);
        let result = self.post_xml::<_, SmsListResponse>("/api/sms/sms-list", &request).await
            .map(|response| {
                let mut messages = response.messages.message;
                messages.sort_by_key(|message| message.index);
                messages
            });
        self.account(&result);
        result
    }

    /// Ask the modem for the delivery state of a previously sent message.
    pub async fn get_status(&self, modem_message_id: &str) -> Result<DeliveryState, ModemError> {
        self.breaker.check().map_err(|_| ModemError::CircuitOpen)?;

        let request = SmsStatusRequest {
            message_id: modem_message_id.to_string()
        };
        let result = self.post_xml::<_, SmsStatusResponse>("/api/sms/sms-status", &request).await
            .map(|response| DeliveryState::from_report(&response.status));
        self.account(&result);
        result
    }

    pub async fn health_check(&self) -> Result<ModemHealth, ModemError> {
        self.breaker.check().map_err(|_| ModemError::CircuitOpen)?;

        let result = self.get_xml::<ModemHealthResponse>("/api/monitoring/status").await
            .map(ModemHealth::from);
        self.account(&result);
        result
    }

    fn account<T>(&self, result: &Result<T, ModemError>) {
        match result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.counts_against_breaker() => self.breaker.record_failure(),

            // An application error document means the modem answered; the
            // operation failed but the hardware path is fine.
            Err(e) => {
                if let ModemError::ModemCode { code, .. } = e {
                    if TOKEN_ERROR_CODES.contains(code) {
                        warn!("Modem rejected session token (code {}), invalidating cache", code);
                        self.session.invalidate();
                    }
                }
                self.breaker.record_success();
            }
        }
    }

    async fn session_token(&self) -> Result<SessionToken, ModemError> {
        if let Some(token) = self.session.get() {
            return Ok(token);
        }

        debug!("Session cache miss, fetching SesTokInfo");
        let response = self.http
            .get(format!("{}/api/webserver/SesTokInfo", self.base_url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModemError::Http(status.as_u16()));
        }

        let body = response.text().await?;
        let info: SesTokInfo = protocol::parse_response(&body)?;
        if info.session_id.is_empty() || info.token.is_empty() {
            return Err(ModemError::Parse("Empty SesTokInfo response".to_string()));
        }

        let token = SessionToken {
            session_id: info.session_id,
            verification_token: info.token
        };
        self.session.store(token.clone());
        Ok(token)
    }

    async fn post_xml<Req: Serialize, Resp: for<'de> serde::Deserialize<'de>>(
        &self,
        path: &str,
        request: &Req
    ) -> Result<Resp, ModemError> {
        let token = self.session_token().await?;
        let body = protocol::serialize_request(request)?;

        let response = self.http
            .post(format!("{}{}", self.base_url, path))
            .header("Cookie", &token.session_id)
            .header("__RequestVerificationToken", &token.verification_token)
            .header("Host", &self.host_header)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModemError::Http(status.as_u16()));
        }

        let body = response.text().await?;
        protocol::parse_response(&body)
    }

    async fn get_xml<Resp: for<'de> serde::Deserialize<'de>>(
        &self,
        path: &str
    ) -> Result<Resp, ModemError> {
        let token = self.session_token().await?;

        let response = self.http
            .get(format!("{}{}", self.base_url, path))
            .header("Cookie", &token.session_id)
            .header("__RequestVerificationToken", &token.verification_token)
            .header("Host", &self.host_header)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModemError::Http(status.as_u16()));
        }

        let body = response.text().await?;
        protocol::parse_response(&body)
    }
}
