//! # Function queue consumer.
//!
//! One long-running loop per active function: fetch an assignment, bind it
//! to a live instance, execute it, persist the outcome, acknowledge.
//!
//! ## Disposition table
//! Every fetched message ends in exactly one of three places:
//!
//! | condition | disposition |
//! |---|---|
//! | undecodable payload | nak (backoff, dead-letter after max_deliver) |
//! | function mismatch | ack — routing bug, retrying cannot fix it |
//! | record absent / terminal | ack — the record owns the truth |
//! | pool at capacity | nak — redeliver once pressure drops |
//! | claim CAS lost | ack — the conflicting writer owns the outcome |
//! | executed (any outcome) | terminal CAS, then ack |
//!
//! ## Rules
//! - The loop exits only when its token fires or the bound instance dies;
//!   fetch errors are logged and polled through.
//! - Execution is bounded by `ack_wait`: a slower execution would be
//!   redelivered anyway, so it is cut off and recorded as failed.
//! - A cancel persisted by anyone else wins every CAS race here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerConsumer, ConsumerConfig, Delivery};
use crate::config::ConsumerSettings;
use crate::domain::{TaskAssignment, TaskResult};
use crate::error::Error;
use crate::metrics::AgentMetrics;
use crate::names::FunctionName;
use crate::store::{TaskStore, STREAM_TASKS};

use super::instance::{ExecError, Instance};
use super::manager::InstanceManager;

/// Steady-state poll period. Not part of the delivery contract.
const TICK: Duration = Duration::from_millis(500);
/// Single-fetch deadline inside one tick.
const FETCH_WAIT: Duration = Duration::from_millis(100);

/// Per-function consumer loop.
pub struct FunctionConsumer {
    function: FunctionName,
    pod_name: String,
    settings: ConsumerSettings,
    consumer: Arc<dyn BrokerConsumer>,
    store: TaskStore,
    manager: Arc<InstanceManager>,
    metrics: Arc<AgentMetrics>,
    instance: Option<Arc<Instance>>,
}

impl FunctionConsumer {
    /// Ensures the durable consumer `<pod>-<function>` on the task stream
    /// and returns the loop ready to run.
    pub async fn subscribe(
        broker: Arc<dyn Broker>,
        pod_name: impl Into<String>,
        function: FunctionName,
        settings: ConsumerSettings,
        store: TaskStore,
        manager: Arc<InstanceManager>,
        metrics: Arc<AgentMetrics>,
    ) -> Result<Self, Error> {
        let pod_name = pod_name.into();
        let consumer = broker
            .create_consumer(
                STREAM_TASKS,
                ConsumerConfig {
                    durable_name: format!("{pod_name}-{}", function.slug()),
                    filter_subject: function.queue_subject(),
                    ack_wait: settings.ack_wait,
                    max_ack_pending: settings.max_ack_pending,
                    max_deliver: settings.max_deliver,
                    backoff: settings.backoff.clone(),
                },
            )
            .await?;

        Ok(Self {
            function,
            pod_name,
            settings,
            consumer,
            store,
            manager,
            metrics,
            instance: None,
        })
    }

    /// Runs until the token fires or the bound instance dies.
    pub async fn run(mut self, token: CancellationToken) {
        info!(pod = %self.pod_name, function = %self.function, "task consumer started");

        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut empty_polls: u64 = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(pod = %self.pod_name, function = %self.function, "consumer canceled");
                    return;
                }
                _ = tick.tick() => {}
            }

            if let Some(inst) = &self.instance {
                if !inst.is_alive() {
                    info!(
                        pod = %self.pod_name,
                        function = %self.function,
                        "instance gone, stopping consumer",
                    );
                    return;
                }
            }

            let delivery = match self.consumer.fetch(FETCH_WAIT).await {
                Ok(d) => d,
                Err(e) if e.is_no_messages() => {
                    empty_polls += 1;
                    self.metrics
                        .poll_empty
                        .with_label_values(&[&self.pod_name, "task", self.function.as_str()])
                        .inc();
                    if empty_polls % 50 == 0 {
                        debug!(
                            pod = %self.pod_name,
                            function = %self.function,
                            polls = empty_polls,
                            "polling empty queue",
                        );
                    }
                    continue;
                }
                Err(e) => {
                    warn!(
                        pod = %self.pod_name,
                        function = %self.function,
                        error = %e,
                        "task fetch failed",
                    );
                    continue;
                }
            };
            empty_polls = 0;

            self.metrics
                .messages_fetched
                .with_label_values(&[&self.pod_name, "task", self.function.as_str()])
                .inc();
            self.metrics
                .payload_size
                .with_label_values(&[&self.pod_name, self.function.as_str()])
                .observe(delivery.payload.len() as f64);

            self.handle(&token, delivery).await;
        }
    }

    /// Processes one delivery through decode → bind → claim → execute →
    /// persist, ending in exactly one ack or nak.
    async fn handle(&mut self, token: &CancellationToken, delivery: Delivery) {
        let assignment: TaskAssignment = match serde_json::from_slice(&delivery.payload) {
            Ok(a) => a,
            Err(e) => {
                self.fail_metric("unmarshal");
                error!(
                    pod = %self.pod_name,
                    function = %self.function,
                    attempt = delivery.attempt,
                    error = %e,
                    "unmarshal assignment failed",
                );
                delivery.nak().await;
                return;
            }
        };

        if assignment.function_id != self.function {
            // A message on the wrong queue is a routing bug, not a
            // retriable condition.
            self.fail_metric("mismatch");
            warn!(
                pod = %self.pod_name,
                expected = %self.function,
                got = %assignment.function_id,
                "function mismatch",
            );
            delivery.ack().await;
            return;
        }

        let name = assignment.task_name();
        let (mut task, revision) = match self.store.get(&name).await {
            Ok(v) => v,
            Err(Error::NotFound { .. }) => {
                debug!(task = %name, "record deleted, dropping assignment");
                delivery.ack().await;
                return;
            }
            Err(e) => {
                warn!(task = %name, error = %e, "record read failed");
                delivery.nak().await;
                return;
            }
        };
        if task.state.is_terminal() {
            debug!(task = %name, state = ?task.state, "record already terminal");
            delivery.ack().await;
            return;
        }

        let instance = match self.ensure_instance().await {
            Ok(inst) => inst,
            Err(Error::CapacityExceeded { max }) => {
                self.fail_metric("capacity");
                debug!(
                    pod = %self.pod_name,
                    function = %self.function,
                    max,
                    "pool at capacity, backing off",
                );
                delivery.nak().await;
                return;
            }
            Err(e) => {
                warn!(function = %self.function, error = %e, "instance acquire failed");
                delivery.nak().await;
                return;
            }
        };

        // Claim: pending -> processing.
        if task.start(Utc::now()).is_err() {
            debug!(task = %name, state = ?task.state, "record not pending, skipping");
            delivery.ack().await;
            return;
        }
        let revision = match self.store.update(&task, revision).await {
            Ok(rev) => rev,
            Err(Error::Conflict { .. }) => {
                debug!(task = %name, "claim lost, conflicting writer owns the outcome");
                delivery.ack().await;
                return;
            }
            Err(e) => {
                warn!(task = %name, error = %e, "claim write failed");
                delivery.nak().await;
                return;
            }
        };

        let started = Instant::now();
        let outcome = match timeout(
            self.settings.ack_wait,
            instance.execute(token, &assignment),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(ExecError::Timeout {
                timeout: self.settings.ack_wait,
            }),
        };
        let ended_at = Utc::now();

        match outcome {
            Ok(output) => {
                let applied = if output.is_empty() {
                    // The result invariant forbids empty payloads.
                    task.fail("runner returned empty output", ended_at)
                } else {
                    TaskResult::inline(output).and_then(|r| task.succeed(r, ended_at))
                };
                if let Err(e) = applied {
                    warn!(task = %name, error = %e, "recording outcome failed");
                } else {
                    self.metrics
                        .execution_duration
                        .with_label_values(&[&self.pod_name, self.function.as_str()])
                        .observe(started.elapsed().as_secs_f64());
                    self.metrics
                        .messages_processed
                        .with_label_values(&[&self.pod_name, self.function.as_str()])
                        .inc();
                    info!(
                        pod = %self.pod_name,
                        task = %name,
                        function = %self.function,
                        duration = ?started.elapsed(),
                        "task completed",
                    );
                }
            }
            Err(ExecError::Canceled) => {
                info!(task = %name, "execution canceled");
                if let Err(e) = task.cancel(ended_at) {
                    debug!(task = %name, error = %e, "cancel transition skipped");
                }
            }
            Err(e) => {
                self.fail_metric("execute");
                error!(task = %name, error = %e, "task execute failed");
                if let Err(e) = task.fail(e.to_string(), ended_at) {
                    debug!(task = %name, error = %e, "fail transition skipped");
                }
            }
        }

        // Persist the terminal state. A conflict means someone else -- by
        // the state machine, a cancel -- already owns the record.
        match self.store.update(&task, revision).await {
            Ok(_) => {}
            Err(Error::Conflict { .. }) => {
                debug!(task = %name, "terminal write lost, cancel wins");
            }
            Err(e) => {
                warn!(task = %name, error = %e, "terminal write failed");
            }
        }
        delivery.ack().await;
    }

    /// Returns the bound instance, acquiring one lazily.
    async fn ensure_instance(&mut self) -> Result<Arc<Instance>, Error> {
        if let Some(inst) = &self.instance {
            if inst.is_alive() {
                return Ok(Arc::clone(inst));
            }
        }
        let inst = self.manager.acquire(&self.function).await?;
        self.instance = Some(Arc::clone(&inst));
        Ok(inst)
    }

    fn fail_metric(&self, reason: &str) {
        self.metrics
            .messages_failed
            .with_label_values(&[&self.pod_name, self.function.as_str(), reason])
            .inc();
    }
}
