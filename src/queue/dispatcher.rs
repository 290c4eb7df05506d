use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use crate::modem::error::ModemError;
use crate::modem::ModemClient;
use crate::queue::{Job, JobQueue, QUEUE_SMS_SEND, SNOOZE_DELAY_SECS};
use crate::sms::types::MessageStatus;
use crate::sms::SMSManager;

const IDLE_POLL: Duration = Duration::from_millis(250);
const PAUSE_POLL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

const RATE_WINDOW: Duration = Duration::from_secs(60);

type SendRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Consumer for the sms_send queue. Two independent throttles: a semaphore
/// caps simultaneous executions, a token bucket caps starts per rolling
/// window. The modem hardware tolerates neither bursts nor parallel floods.
pub struct SendDispatcher {
    queue: JobQueue,
    manager: SMSManager,
    modem: ModemClient,
    concurrency: usize,
    rate_limit: u32
}

impl SendDispatcher {
    pub fn new(
        queue: JobQueue,
        manager: SMSManager,
        modem: ModemClient,
        concurrency: usize,
        rate_limit: u32
    ) -> Self {
        Self {
            queue,
            manager,
            modem,
            concurrency: concurrency.max(1),
            rate_limit: rate_limit.max(1)
        }
    }

    pub async fn run(self) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let limiter = Arc::new(Self::build_limiter(self.rate_limit));

        info!(
            "SendDispatcher started (concurrency {}, {} sends / {}s)",
            self.concurrency, self.rate_limit, RATE_WINDOW.as_secs()
        );

        loop {
            if self.queue.is_paused() {
                sleep(PAUSE_POLL).await;
                continue;
            }

            match self.queue.has_ready(QUEUE_SMS_SEND).await {
                Ok(true) => {},
                Ok(false) => {
                    sleep(IDLE_POLL).await;
                    continue;
                },
                Err(e) => {
                    error!("Failed to poll sms_send queue: {:?}", e);
                    sleep(ERROR_BACKOFF).await;
                    continue;
                }
            }

            // Hardware budget first, so a claimed job never waits on a token.
            limiter.until_ready().await;
            if self.queue.is_paused() {
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break
            };

            let job = match self.queue.claim(QUEUE_SMS_SEND).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    continue;
                },
                Err(e) => {
                    error!("Failed to claim sms_send job: {:?}", e);
                    drop(permit);
                    sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            let queue = self.queue.clone();
            let manager = self.manager.clone();
            let modem = self.modem.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = Self::run_job(&queue, &manager, &modem, &job).await {
                    error!(
                        "Send job #{} (message {}, attempt {}) errored outside classification: {:?}",
                        job.job_id, job.message_id, job.attempt, e
                    );
                }
            });
        }
    }

    fn build_limiter(rate_limit: u32) -> SendRateLimiter {
        let burst = NonZeroU32::new(rate_limit).unwrap_or(nonzero!(1u32));
        let quota = Quota::with_period(RATE_WINDOW / burst.get())
            .unwrap_or_else(|| Quota::per_minute(burst))
            .allow_burst(burst);
        RateLimiter::direct(quota)
    }

    async fn run_job(
        queue: &JobQueue,
        manager: &SMSManager,
        modem: &ModemClient,
        job: &Job
    ) -> anyhow::Result<()> {
        let message = match manager.get_message(&job.message_id).await? {
            Some(message) => message,
            None => {
                warn!("Send job #{} references missing message {}", job.job_id, job.message_id);
                queue.cancel(job.job_id, "Message not found").await?;
                return Ok(());
            }
        };

        if !message.status.is_send_actionable() {
            debug!(
                "Send job #{} dropped, message {} is {}",
                job.job_id, message.message_id, message.status.as_str()
            );
            queue.cancel(job.job_id, "Message not actionable").await?;
            return Ok(());
        }

        // A sending mark left by a crashed worker blocks the claim; clear it.
        if message.status == MessageStatus::Sending {
            manager.requeue(&job.message_id).await?;
        }

        if !Self::claim_message(manager, queue, job).await? {
            return Ok(());
        }

        match modem.send_sms(&message.phone_number, &message.content).await {
            Ok(modem_message_id) => {
                if manager.mark_sent(&job.message_id, &modem_message_id).await? {
                    info!(
                        "Message {} sent as {} (job #{}, attempt {})",
                        job.message_id, modem_message_id, job.job_id, job.attempt
                    );
                    queue.complete(job.job_id).await?;
                } else {
                    warn!("Message {} changed state mid-send, dropping job #{}", job.message_id, job.job_id);
                    queue.cancel(job.job_id, "Sent mark lost race").await?;
                }
                Ok(())
            },
            Err(error) => Self::handle_send_error(queue, manager, job, error).await
        }
    }

    /// Mark the message sending. False means the job was already resolved
    /// (cancelled or discarded) and must not proceed to the modem.
    async fn claim_message(
        manager: &SMSManager,
        queue: &JobQueue,
        job: &Job
    ) -> anyhow::Result<bool> {
        match manager.mark_sending(&job.message_id).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                debug!("Message {} no longer claimable, dropping job #{}", job.message_id, job.job_id);
                queue.cancel(job.job_id, "Message not actionable").await?;
                Ok(false)
            },
            Err(e) => {
                // Store failure while claiming is not worth a retry cycle.
                let reason = format!("Failed to mark message sending: {}", e);
                error!(
                    "Send job #{} (message {}, attempt {}): {}",
                    job.job_id, job.message_id, job.attempt, reason
                );
                let _ = manager.mark_failed(&job.message_id, &reason).await;
                queue.discard(job.job_id, &reason).await?;
                Ok(false)
            }
        }
    }

    async fn handle_send_error(
        queue: &JobQueue,
        manager: &SMSManager,
        job: &Job,
        error: ModemError
    ) -> anyhow::Result<()> {
        let reason = error.failure_reason();

        if matches!(error, ModemError::CircuitOpen) {
            debug!(
                "Circuit open, snoozing send job #{} (message {}) for {}s",
                job.job_id, job.message_id, SNOOZE_DELAY_SECS
            );
            manager.requeue(&job.message_id).await?;
            queue.snooze(job.job_id, SNOOZE_DELAY_SECS).await?;
            return Ok(());
        }

        if error.is_retryable() {
            warn!(
                "Send job #{} (message {}, attempt {}/{}) failed retryably: {}",
                job.job_id, job.message_id, job.attempt, job.max_attempts, reason
            );
            manager.requeue(&job.message_id).await?;
            let discarded = queue.retry_or_discard(job, &reason).await?;
            if discarded {
                error!(
                    "Send job #{} exhausted attempts, message {} failed: {}",
                    job.job_id, job.message_id, reason
                );
                manager.mark_failed(&job.message_id, &reason).await?;
            }
        } else {
            error!(
                "Send job #{} (message {}, attempt {}) failed permanently: {}",
                job.job_id, job.message_id, job.attempt, reason
            );
            manager.mark_failed(&job.message_id, &reason).await?;
            queue.cancel(job.job_id, &reason).await?;
        }
        Ok(())
    }
}
