use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>
}

/// Shared guard in front of the modem. All clones observe the same state;
/// every wire call must bracket itself with `check` and then exactly one of
/// `record_success` / `record_failure`.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<BreakerInner>>,
    threshold: u32,
    cooldown: Duration
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_settings(FAILURE_THRESHOLD, OPEN_COOLDOWN)
    }

    pub fn with_settings(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None
            })),
            threshold,
            cooldown
        }
    }

    /// Gate at the top of every modem operation. Ok means the call may
    /// proceed (including the single half-open probe); Err means fail fast
    /// with no I/O.
    pub fn check(&self) -> Result<(), ()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);

                if elapsed >= self.cooldown {
                    debug!("Circuit breaker cooldown elapsed, allowing half-open probe");
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != BreakerState::Closed {
            debug!("Circuit breaker closing after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("Circuit breaker probe failed, re-opening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            },
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    warn!(
                        "Circuit breaker opening after {} consecutive modem failures",
                        inner.consecutive_failures
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            },
            // A straggler failing while already open changes nothing.
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::with_settings(5, Duration::from_secs(300));

        for _ in 0..4 {
            assert!(breaker.check().is_ok());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Sixth call fails fast without I/O.
        assert!(breaker.check().is_err());
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = CircuitBreaker::with_settings(5, Duration::from_secs(300));

        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::with_settings(1, Duration::ZERO);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Zero cooldown: next check transitions to half-open and lets one probe through.
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::with_settings(1, Duration::ZERO);

        breaker.record_failure();
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_open_blocks_until_cooldown() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_secs(300));

        breaker.record_failure();
        assert!(breaker.check().is_err());
        assert!(breaker.check().is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_clones_share_state() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_secs(300));
        let clone = breaker.clone();

        breaker.record_failure();
        assert!(clone.check().is_err());
    }
}
