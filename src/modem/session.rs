use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SESSION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SessionToken {
    pub session_id: String,
    pub verification_token: String
}

#[derive(Debug)]
struct CachedSession {
    token: SessionToken,
    refreshed_at: Instant
}

/// Cache for the modem's (SessionID, __RequestVerificationToken) pair.
/// Concurrent refreshes race benignly: whoever stores last wins, and every
/// stored pair is valid.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<Mutex<Option<CachedSession>>>,
    ttl: Duration
}

impl SessionCache {
    pub fn new() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            ttl
        }
    }

    pub fn get(&self) -> Option<SessionToken> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref()
            .filter(|cached| cached.refreshed_at.elapsed() < self.ttl)
            .map(|cached| cached.token.clone())
    }

    pub fn store(&self, token: SessionToken) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.replace(CachedSession {
            token,
            refreshed_at: Instant::now()
        });
    }

    /// Drop the cached pair, forcing the next caller to re-handshake.
    pub fn invalidate(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}
