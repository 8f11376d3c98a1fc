//! The drip worker: a single-flight consumer that drains the job store at
//! one job per drip interval, calls the downstream API, records the
//! result, updates batch accounting, and fans results out to callbacks.

use std::sync::Arc;
use std::time;

use chrono::Utc;
use drip_common::job::{Job, JobOutcome, ResultRecord};
use drip_common::liveness::Liveness;
use drip_common::registry::ToolRegistry;
use drip_common::retry::RetryPolicy;
use drip_common::store::JobStore;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::callback::{CallbackDispatcher, CallbackPayload};
use crate::downstream::DownstreamClient;
use crate::drip::DripGate;
use crate::error::{JobError, WorkerError};

pub struct DripWorker {
    store: Arc<dyn JobStore>,
    registry: &'static ToolRegistry,
    downstream: DownstreamClient,
    callbacks: Arc<CallbackDispatcher>,
    /// Minimum spacing between the starts of consecutive job executions.
    drip_interval: time::Duration,
    /// How often to re-check the queue while it is empty.
    poll_interval: time::Duration,
    lease_renew_interval: time::Duration,
    /// Scheduler-level backoff between executions of the same job.
    job_retry_policy: RetryPolicy,
    /// How long a shutdown waits for the in-flight job before abandoning it.
    grace_period: time::Duration,
    liveness: Liveness,
}

impl DripWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: &'static ToolRegistry,
        downstream: DownstreamClient,
        callbacks: Arc<CallbackDispatcher>,
        drip_interval: time::Duration,
        poll_interval: time::Duration,
        lease_renew_interval: time::Duration,
        job_retry_policy: RetryPolicy,
        grace_period: time::Duration,
        liveness: Liveness,
    ) -> Self {
        Self {
            store,
            registry,
            downstream,
            callbacks,
            drip_interval,
            poll_interval,
            lease_renew_interval,
            job_retry_policy,
            grace_period,
            liveness,
        }
    }

    /// Run this worker until `shutdown` flips to true. Exactly one job is
    /// in flight at any moment, and consecutive executions start at least
    /// one drip interval apart.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let mut gate = DripGate::new(self.drip_interval);
        info!(
            drip_interval_ms = self.drip_interval.as_millis() as u64,
            "drip worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = gate.wait_ready() => {}
            }

            let job = tokio::select! {
                _ = shutdown.changed() => break,
                claimed = self.wait_for_job() => match claimed {
                    Ok(job) => job,
                    Err(e) => {
                        error!("failed to claim a job: {}", e);
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                },
            };
            gate.mark_start();

            let processing = self.process_job(job);
            tokio::pin!(processing);
            tokio::select! {
                result = &mut processing => {
                    if let Err(e) = result {
                        error!("job bookkeeping failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, letting the in-flight job finish");
                    match tokio::time::timeout(self.grace_period, &mut processing).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("job bookkeeping failed during shutdown: {}", e),
                        Err(_) => {
                            warn!("grace period elapsed, abandoning job; its lease will expire");
                        }
                    }
                    break;
                }
            }
        }

        info!("drip worker stopped");
        Ok(())
    }

    /// Poll the queue until a job can be claimed.
    async fn wait_for_job(&self) -> Result<Job, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.beat();

            if let Some(job) = self.store.claim_next().await? {
                return Ok(job);
            }
        }
    }

    /// Drive one claimed job to a scheduler decision: completed, parked for
    /// a later attempt, or failed for good.
    async fn process_job(&self, mut job: Job) -> Result<(), WorkerError> {
        job.started_at = Some(Utc::now());
        let labels = [("tool", job.tool.clone())];
        metrics::counter!("drip_jobs_total", &labels).increment(1);

        let started = tokio::time::Instant::now();
        let renewer = self.spawn_lease_renewal(job.job_id.clone());
        let verdict = self.execute(&job).await;
        renewer.abort();

        job.attempts_made += 1;
        job.finished_at = Some(Utc::now());
        let elapsed = started.elapsed().as_secs_f64();

        match verdict {
            Ok(data) => {
                let record = ResultRecord::completed(&job, data);
                // The result record always lands before the callback fires.
                self.store.write_result(&record).await?;
                self.store.complete_job(&job).await?;
                if let Some(batch_id) = &job.batch_id {
                    self.store
                        .record_outcome(batch_id, JobOutcome::Completed)
                        .await?;
                }

                metrics::counter!("drip_jobs_completed", &labels).increment(1);
                metrics::histogram!("drip_jobs_processing_duration_seconds", &labels)
                    .record(elapsed);
                info!(
                    job_id = %job.job_id,
                    tool = %job.tool,
                    attempt = job.attempts_made,
                    "job completed"
                );

                self.fire_callback(&job, &record);
            }
            Err(error) if error.is_retryable() && job.has_attempts_remaining() => {
                let delay = self.job_retry_policy.time_until_next_retry(job.attempts_made);
                info!(
                    job_id = %job.job_id,
                    tool = %job.tool,
                    attempt = job.attempts_made,
                    delay_ms = delay.as_millis() as u64,
                    "job attempt failed, scheduling retry: {}",
                    error
                );

                // The retried execution gets fresh timestamps.
                job.started_at = None;
                job.finished_at = None;
                self.store.schedule_retry(job, delay).await?;

                metrics::counter!("drip_jobs_retried", &labels).increment(1);
            }
            Err(error) => {
                let record = ResultRecord::failed(&job, error.to_string());
                self.store.write_result(&record).await?;
                self.store.fail_job(&job).await?;
                if let Some(batch_id) = &job.batch_id {
                    self.store
                        .record_outcome(batch_id, JobOutcome::Failed)
                        .await?;
                }

                metrics::counter!("drip_jobs_failed", &labels).increment(1);
                warn!(
                    job_id = %job.job_id,
                    tool = %job.tool,
                    attempts = job.attempts_made,
                    "job failed: {}",
                    error
                );

                self.fire_callback(&job, &record);
            }
        }

        Ok(())
    }

    /// One execution: resolve the tool, check its required parameters, and
    /// make the downstream call. Registry failures are terminal on the
    /// first attempt; the downstream client exhausts its own transport
    /// retries before returning.
    async fn execute(&self, job: &Job) -> Result<Value, JobError> {
        let entry = self
            .registry
            .lookup(&job.tool)
            .ok_or_else(|| JobError::UnknownTool(job.tool.clone()))?;

        let validation = self.registry.validate(&job.tool, &job.params);
        if !validation.ok {
            return Err(JobError::MissingParams(validation.missing));
        }

        Ok(self.downstream.call(entry, &job.params).await?)
    }

    /// Keep the store lease alive while a job is being processed. Aborted
    /// as soon as processing reaches a decision.
    fn spawn_lease_renewal(&self, job_id: String) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let period = self.lease_renew_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // the first tick fires immediately

            loop {
                interval.tick().await;
                match store.renew_lease(&job_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%job_id, "lease lost; the job may be re-claimed");
                        return;
                    }
                    Err(e) => warn!(%job_id, "failed to renew lease: {}", e),
                }
            }
        })
    }

    /// Hand the result off to the dispatcher without blocking the drip
    /// loop. Delivery failures are reported but never touch job state.
    fn fire_callback(&self, job: &Job, record: &ResultRecord) {
        if job.callback_url.is_none() {
            return;
        }

        let url = job.callback_url.clone();
        let payload = CallbackPayload::from_result(job, record);
        let dispatcher = self.callbacks.clone();
        let job_id = job.job_id.clone();

        tokio::spawn(async move {
            let outcome = dispatcher.dispatch(url.as_deref(), &payload).await;
            let status = if outcome.success { "success" } else { "failure" };
            metrics::counter!("callback_deliveries_total", &[("status", status)]).increment(1);

            if outcome.success {
                info!(%job_id, attempts = outcome.attempts, "callback delivered");
            } else {
                warn!(
                    %job_id,
                    attempts = outcome.attempts,
                    "callback delivery failed: {}",
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        });
    }
}
