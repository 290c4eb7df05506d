use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Result};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};
use crate::auth::ApiKeyManager;
use crate::config::AppConfig;
use crate::http::create_app;
use crate::modem::breaker::CircuitBreaker;
use crate::modem::ModemClient;
use crate::queue::dispatcher::SendDispatcher;
use crate::queue::monitor::{HealthHandle, HealthMonitor};
use crate::queue::poller::InboxPoller;
use crate::queue::reconciler::StatusReconciler;
use crate::queue::JobQueue;
use crate::sms::database::SMSDatabase;
use crate::sms::SMSManager;

const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct AppState {
    pub sms_manager: SMSManager,
    pub api_keys: ApiKeyManager,
    pub queue: JobQueue,
    pub modem: ModemClient,
    pub health: HealthHandle
}

pub struct AppHandles {
    tasks: Vec<(&'static str, JoinHandle<()>)>
}
impl AppHandles {
    pub async fn create(config: AppConfig) -> Result<AppHandles> {
        let database = Arc::new(SMSDatabase::connect(&config.database).await?);

        let queue = JobQueue::new(database.pool().clone());
        queue.recover_stale().await?;

        let modem = match ModemClient::new(&config.modem, CircuitBreaker::new()) {
            Ok(modem) => modem,
            Err(e) => bail!("Failed to create modem client: {:?}", e)
        };

        let sms_manager = SMSManager::new(Arc::clone(&database), queue.clone());
        let (api_keys, key_usage_handle) =
            ApiKeyManager::new(Arc::clone(&database), config.auth.default_rate_limit);

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        tasks.push(("Key Usage Worker", key_usage_handle));

        let dispatcher = SendDispatcher::new(
            queue.clone(),
            sms_manager.clone(),
            modem.clone(),
            config.queue.send_concurrency,
            config.queue.send_rate_limit
        );
        tasks.push(("Send Dispatcher", tokio::spawn(dispatcher.run())));

        let poller = InboxPoller::new(
            sms_manager.clone(),
            modem.clone(),
            Duration::from_millis(config.modem.poll_interval_ms)
        );
        tasks.push(("Inbox Poller", tokio::spawn(poller.run())));

        let reconciler = StatusReconciler::new(sms_manager.clone(), modem.clone());
        tasks.push(("Status Reconciler", tokio::spawn(reconciler.run())));

        let monitor = HealthMonitor::new(
            modem.clone(),
            queue.clone(),
            Duration::from_millis(config.modem.health_check_interval_ms)
        );
        let health = monitor.handle();
        tasks.push(("Health Monitor", tokio::spawn(monitor.run())));

        let limiter = api_keys.limiter().clone();
        tasks.push(("Rate Limit Sweeper", tokio::spawn(async move {
            let mut ticker = interval(RATE_LIMIT_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                limiter.sweep_stale();
            }
        })));

        if let Some(http_handle) = Self::start_http_server(&config, AppState {
            sms_manager,
            api_keys,
            queue,
            modem,
            health
        }) {
            tasks.push(("HTTP Server", http_handle));
        }

        Ok(AppHandles { tasks })
    }

    /// Block until the first background task stops. Every task here is a
    /// forever-loop, so one finishing means the gateway is broken; dropping
    /// the surviving handles cancels them and the process exits.
    pub async fn run(self) {
        let watched: Vec<_> = self.tasks
            .into_iter()
            .map(|(name, handle)| Box::pin(async move { (name, handle.await) }))
            .collect();

        info!("Gateway running with {} background tasks", watched.len());

        let ((name, result), _, survivors) = futures::future::select_all(watched).await;
        match result {
            Ok(()) => warn!("Background task '{}' exited, shutting down", name),
            Err(e) => error!("Background task '{}' aborted ({:?}), shutting down", name, e)
        }
        drop(survivors);
    }

    fn start_http_server(config: &AppConfig, state: AppState) -> Option<JoinHandle<()>> {
        if !config.http.enabled {
            info!("HTTP server disabled in config");
            return None;
        }

        let address = config.http.address;
        let handle = tokio::spawn(async move {
            let app = create_app(state);
            let listener = match tokio::net::TcpListener::bind(address).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind HTTP listener on {}: {:?}", address, e);
                    return;
                }
            };

            info!("Started HTTP listener @ {}", address);
            match axum::serve(listener, app).await {
                Ok(_) => info!("HTTP server terminated."),
                Err(e) => error!("HTTP server error: {:?}", e)
            }
        });
        Some(handle)
    }
}
