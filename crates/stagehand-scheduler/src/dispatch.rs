//! Dispatch of job instances to agents with bounded retries.

use crate::config::DispatchConfig;
use stagehand_core::ids::JobInstanceId;
use stagehand_core::ports::{Ack, AgentDispatch, DispatchRequest};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of submitting a job instance.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Accepted(Ack),
    /// Every attempt failed or was rejected.
    Exhausted { attempts: u32, last_error: String },
    /// The job instance is already being submitted.
    AlreadyInFlight,
    /// The job instance was finished or cancelled while being submitted.
    Withdrawn { attempts: u32 },
}

pub struct Dispatcher {
    agent: Arc<dyn AgentDispatch>,
    config: DispatchConfig,
    in_flight: Mutex<HashSet<JobInstanceId>>,
    withdrawn: Notify,
}

impl Dispatcher {
    pub fn new(agent: Arc<dyn AgentDispatch>, config: DispatchConfig) -> Self {
        Self {
            agent,
            config,
            in_flight: Mutex::new(HashSet::new()),
            withdrawn: Notify::new(),
        }
    }

    /// Submit a request, retrying with exponential backoff. A second submit
    /// for a job instance that is still being submitted is refused.
    pub async fn submit(&self, request: &DispatchRequest) -> DispatchOutcome {
        self.submit_while(request, || async { true }).await
    }

    /// Like [`Dispatcher::submit`], but `wanted` is checked before every
    /// attempt and after every backoff. Once it returns false no further
    /// attempt is made, and an accepted dispatch is cancelled on the agent.
    pub async fn submit_while<F, Fut>(&self, request: &DispatchRequest, wanted: F) -> DispatchOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let id = request.job_instance.id;
        if !self.claim(id) {
            debug!(job_instance_id = %id, "Dispatch already in flight");
            return DispatchOutcome::AlreadyInFlight;
        }

        let outcome = self.submit_with_retry(request, &wanted).await;
        self.release(id);
        outcome
    }

    /// Wake every backoff so it re-checks whether its job is still wanted.
    pub fn interrupt_backoff(&self) {
        self.withdrawn.notify_waiters();
    }

    async fn submit_with_retry<F, Fut>(&self, request: &DispatchRequest, wanted: &F) -> DispatchOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let id = request.job_instance.id;
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if !wanted().await {
                debug!(job_instance_id = %id, attempt, "Dispatch withdrawn");
                return DispatchOutcome::Withdrawn {
                    attempts: attempt - 1,
                };
            }

            let result =
                tokio::time::timeout(self.config.ack_timeout(), self.agent.dispatch(request)).await;

            match result {
                Ok(Ok(ack)) if ack.accepted => {
                    if !wanted().await {
                        info!(job_instance_id = %id, attempt, "Job finished while dispatching, cancelling on agent");
                        self.cancel(id).await;
                        return DispatchOutcome::Withdrawn { attempts: attempt };
                    }
                    info!(
                        job_instance_id = %id,
                        agent = ?ack.agent,
                        attempt,
                        "Job dispatched"
                    );
                    return DispatchOutcome::Accepted(ack);
                }
                Ok(Ok(ack)) => {
                    last_error = ack
                        .message
                        .unwrap_or_else(|| "rejected by agent".to_string());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "no acknowledgement within {}ms",
                        self.config.ack_timeout_ms
                    );
                }
            }

            if attempt < max_attempts {
                let delay = self.config.backoff(attempt);
                warn!(
                    job_instance_id = %id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Dispatch attempt failed, retrying"
                );
                if !self.backoff(delay, wanted).await {
                    debug!(job_instance_id = %id, attempt, "Dispatch withdrawn during backoff");
                    return DispatchOutcome::Withdrawn { attempts: attempt };
                }
            }
        }

        warn!(
            job_instance_id = %id,
            attempts = max_attempts,
            error = %last_error,
            "Dispatch attempts exhausted"
        );
        DispatchOutcome::Exhausted {
            attempts: max_attempts,
            last_error,
        }
    }

    /// Sleep for `delay`. Returns false as soon as an interrupt finds the job
    /// no longer wanted.
    async fn backoff<F, Fut>(&self, delay: Duration, wanted: &F) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = self.withdrawn.notified() => {
                    if !wanted().await {
                        return false;
                    }
                }
            }
        }
    }

    /// Ask the agent to stop a job instance. Failures are logged.
    pub async fn cancel(&self, id: JobInstanceId) {
        if let Err(e) = self.agent.cancel(id).await {
            warn!(job_instance_id = %id, error = %e, "Cancel request failed");
        }
    }

    pub fn is_in_flight(&self, id: JobInstanceId) -> bool {
        self.lock().contains(&id)
    }

    fn claim(&self, id: JobInstanceId) -> bool {
        self.lock().insert(id)
    }

    fn release(&self, id: JobInstanceId) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<JobInstanceId>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}
