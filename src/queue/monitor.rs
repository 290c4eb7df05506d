use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};
use crate::modem::{ModemClient, ModemHealth};
use crate::queue::JobQueue;

const LOW_SIGNAL_THRESHOLD: u8 = 20;

#[derive(Debug)]
struct MonitorState {
    last_health: Option<ModemHealth>,
    is_healthy: bool
}

/// Read-side view of the monitor, cheap to clone into the HTTP layer.
#[derive(Clone)]
pub struct HealthHandle {
    state: Arc<RwLock<MonitorState>>
}
impl HealthHandle {
    pub fn is_healthy(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).is_healthy
    }

    /// Last known health snapshot, or None when the modem has never been
    /// reachable.
    pub fn snapshot(&self) -> Option<ModemHealth> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).last_health.clone()
    }
}

/// Periodic modem health check. An unhealthy modem pauses the send queue;
/// recovery resumes it. In-flight sends are never aborted.
pub struct HealthMonitor {
    modem: ModemClient,
    queue: JobQueue,
    check_interval: Duration,
    state: Arc<RwLock<MonitorState>>
}

impl HealthMonitor {
    pub fn new(modem: ModemClient, queue: JobQueue, check_interval: Duration) -> Self {
        Self {
            modem,
            queue,
            check_interval,
            state: Arc::new(RwLock::new(MonitorState {
                last_health: None,

                // Optimistic start: the queue runs until a check says otherwise.
                is_healthy: true
            }))
        }
    }

    pub fn handle(&self) -> HealthHandle {
        HealthHandle {
            state: Arc::clone(&self.state)
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.check_interval);
        info!("HealthMonitor started (every {:?})", self.check_interval);

        loop {
            ticker.tick().await;
            self.check_once().await;
        }
    }

    pub async fn check_once(&self) {
        match self.modem.health_check().await {
            Ok(health) => {
                if health.signal_strength < LOW_SIGNAL_THRESHOLD {
                    warn!(
                        "Modem signal strength is low: {} (network {})",
                        health.signal_strength, health.network_name
                    );
                } else {
                    debug!(
                        "Modem healthy: signal {}, network {} ({})",
                        health.signal_strength, health.network_name, health.network_type
                    );
                }

                let was_healthy = {
                    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                    let was = state.is_healthy;
                    state.last_health = Some(health);
                    state.is_healthy = true;
                    was
                };

                if !was_healthy {
                    info!("Modem recovered, resuming send queue");
                    self.queue.resume();
                }
            },
            Err(e) => {
                let was_healthy = {
                    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                    let was = state.is_healthy;
                    state.is_healthy = false;
                    was
                };

                if was_healthy {
                    warn!("Modem health check failed ({}), pausing send queue", e);
                    self.queue.pause();
                } else {
                    debug!("Modem still unhealthy: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use crate::config::ModemConfig;
    use crate::modem::breaker::CircuitBreaker;
    use crate::sms::database::SMSDatabase;

    const SES_TOK_BODY: &str =
        "<response><SesInfo>SessionID=s</SesInfo><TokInfo>t</TokInfo></response>";

    fn health_body(signal: u8) -> String {
        format!(
            "<response>\
             <signal_strength>{}</signal_strength>\
             <network_type>LTE</network_type>\
             <network_name>Operator</network_name>\
             <battery_level>100</battery_level>\
             <connection_status>Connected</connection_status>\
             </response>",
            signal
        )
    }

    async fn monitor(server: &MockServer) -> (HealthMonitor, JobQueue) {
        Mock::given(method("GET"))
            .and(path("/api/webserver/SesTokInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SES_TOK_BODY))
            .mount(server)
            .await;

        let database = StdArc::new(SMSDatabase::connect_in_memory().await.unwrap());
        let queue = JobQueue::new(database.pool().clone());

        let config = ModemConfig {
            base_url: server.uri(),
            poll_interval_ms: 30_000,
            health_check_interval_ms: 60_000
        };
        let modem = ModemClient::new(&config, CircuitBreaker::new()).unwrap();
        (HealthMonitor::new(modem, queue.clone(), Duration::from_secs(60)), queue)
    }

    #[tokio::test]
    async fn test_healthy_check_records_snapshot() {
        let server = MockServer::start().await;
        let (monitor, queue) = monitor(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/monitoring/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(health_body(80)))
            .mount(&server)
            .await;

        monitor.check_once().await;

        let handle = monitor.handle();
        assert!(handle.is_healthy());
        assert_eq!(handle.snapshot().unwrap().signal_strength, 80);
        assert!(!queue.is_paused());
    }

    #[tokio::test]
    async fn test_failure_pauses_and_recovery_resumes() {
        let server = MockServer::start().await;
        let (monitor, queue) = monitor(&server).await;

        // First check fails, the next one succeeds.
        Mock::given(method("GET"))
            .and(path("/api/monitoring/status"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/monitoring/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(health_body(60)))
            .mount(&server)
            .await;

        monitor.check_once().await;
        assert!(!monitor.handle().is_healthy());
        assert!(queue.is_paused());

        monitor.check_once().await;
        assert!(monitor.handle().is_healthy());
        assert!(!queue.is_paused());
    }

    #[tokio::test]
    async fn test_snapshot_survives_unhealthy_period() {
        let server = MockServer::start().await;
        let (monitor, _queue) = monitor(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/monitoring/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(health_body(55)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/monitoring/status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        monitor.check_once().await;
        monitor.check_once().await;

        let handle = monitor.handle();
        assert!(!handle.is_healthy());

        // Last known state is retained for the health endpoint.
        assert_eq!(handle.snapshot().unwrap().signal_strength, 55);
    }
}
