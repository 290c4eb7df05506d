use thiserror::Error;

/// Modem application error codes observed on HiLink firmware.
pub const CODE_SYSTEM_BUSY: i32 = 113;
pub const CODE_SMS_STORAGE_FULL: i32 = 114;
pub const CODE_NETWORK_ERROR: i32 = 115;
pub const CODE_INVALID_PHONE_NUMBER: i32 = 117;
pub const CODE_NETWORK_UNAVAILABLE: i32 = 118;

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("Modem circuit breaker is open")]
    CircuitOpen,

    #[error("Modem returned HTTP {0}")]
    Http(u16),

    #[error("Modem request timed out")]
    Timeout,

    #[error("Modem transport error: {0}")]
    Transport(String),

    #[error("Failed to parse modem response: {0}")]
    Parse(String),

    #[error("Modem error code {code}")]
    ModemCode {
        code: i32,
        message: Option<String>
    }
}
impl ModemError {
    /// Whether a send job hitting this error should go back on the queue
    /// with backoff. Unknown modem codes retry; a misbehaving modem is
    /// indistinguishable from a transient one.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModemError::CircuitOpen => false,
            ModemError::Http(code) => *code >= 500,
            ModemError::Timeout | ModemError::Transport(_) => true,
            ModemError::Parse(_) => false,
            ModemError::ModemCode { code, .. } => !matches!(
                *code,
                CODE_SMS_STORAGE_FULL | CODE_INVALID_PHONE_NUMBER
            )
        }
    }

    /// Whether this error should increment the circuit breaker's failure
    /// count. An application-level error document means the modem answered
    /// and parsed, so it does not.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            ModemError::Http(_) | ModemError::Timeout | ModemError::Transport(_) | ModemError::Parse(_)
        )
    }

    /// Human-readable reason stored on a failed message.
    pub fn failure_reason(&self) -> String {
        match self {
            ModemError::ModemCode { code: CODE_SMS_STORAGE_FULL, .. } =>
                format!("SMS storage full ({})", CODE_SMS_STORAGE_FULL),
            ModemError::ModemCode { code: CODE_INVALID_PHONE_NUMBER, .. } =>
                format!("Invalid phone number ({})", CODE_INVALID_PHONE_NUMBER),
            ModemError::ModemCode { code, message: Some(message) } if !message.is_empty() =>
                format!("Modem error {}: {}", code, message),
            other => other.to_string()
        }
    }
}
impl From<reqwest::Error> for ModemError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ModemError::Timeout
        } else if let Some(status) = err.status() {
            ModemError::Http(status.as_u16())
        } else {
            ModemError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modem_code_classification() {
        let retryable = [CODE_SYSTEM_BUSY, CODE_NETWORK_ERROR, CODE_NETWORK_UNAVAILABLE, 100, 999];
        for code in retryable {
            assert!(ModemError::ModemCode { code, message: None }.is_retryable(), "code {}", code);
        }

        for code in [CODE_SMS_STORAGE_FULL, CODE_INVALID_PHONE_NUMBER] {
            assert!(!ModemError::ModemCode { code, message: None }.is_retryable(), "code {}", code);
        }
    }

    #[test]
    fn test_http_classification() {
        assert!(ModemError::Http(500).is_retryable());
        assert!(ModemError::Http(503).is_retryable());
        assert!(!ModemError::Http(400).is_retryable());
        assert!(!ModemError::Http(404).is_retryable());
    }

    #[test]
    fn test_transport_and_parse() {
        assert!(ModemError::Timeout.is_retryable());
        assert!(ModemError::Transport("connection refused".into()).is_retryable());
        assert!(!ModemError::Parse("garbage".into()).is_retryable());
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(ModemError::Timeout.counts_against_breaker());
        assert!(ModemError::Http(500).counts_against_breaker());
        assert!(ModemError::Parse("x".into()).counts_against_breaker());
        assert!(!ModemError::ModemCode { code: 113, message: None }.counts_against_breaker());
        assert!(!ModemError::CircuitOpen.counts_against_breaker());
    }

    #[test]
    fn test_failure_reasons() {
        let invalid = ModemError::ModemCode { code: 117, message: None };
        assert_eq!(invalid.failure_reason(), "Invalid phone number (117)");

        let full = ModemError::ModemCode { code: 114, message: None };
        assert_eq!(full.failure_reason(), "SMS storage full (114)");

        let other = ModemError::ModemCode { code: 113, message: Some("busy".into()) };
        assert_eq!(other.failure_reason(), "Modem error 113: busy");
    }
}
