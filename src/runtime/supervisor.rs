//! # Agent supervisor.
//!
//! Owns the hint consumer, the instance manager, and the set of
//! per-function consumers, and drives graceful shutdown.
//!
//! ## Hint flow
//! ```text
//! task.hints ──► fetch ──► parse function name
//!                              │
//!                              ├── consumer already running ──► ack (coalesced)
//!                              └── otherwise ──► spawn FunctionConsumer, ack
//! ```
//!
//! ## Shutdown timeline
//! ```text
//! token fires ──► hint loop exits
//!   ──► per-consumer child tokens are already canceled (cascade)
//!   ──► join every consumer, bounded by the grace period (stragglers aborted)
//!   ──► InstanceManager::stop, bounded by the same grace
//! ```
//!
//! ## Rules
//! - The active-consumer map is a single mutex; entries are replaced when
//!   their handle has finished (an instance expiry ends a consumer, and the
//!   next hint restarts it).
//! - A malformed hint is acked: redelivering it cannot make it parse.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, KvBucket};
use crate::config::AgentConfig;
use crate::error::Error;
use crate::metrics::AgentMetrics;
use crate::names::FunctionName;
use crate::store::{HintClient, TaskPublisher, TaskStore};

use super::consumer::FunctionConsumer;
use super::instance::RunnerRef;
use super::manager::InstanceManager;

/// Hint poll period. Not part of the delivery contract.
const TICK: Duration = Duration::from_millis(500);
/// Single-fetch deadline inside one tick.
const FETCH_WAIT: Duration = Duration::from_millis(100);

/// Top-level runtime: hint loop + consumer registry + instance pool.
pub struct AgentSupervisor {
    cfg: AgentConfig,
    broker: Arc<dyn Broker>,
    store: TaskStore,
    hints: HintClient,
    manager: Arc<InstanceManager>,
    metrics: Arc<AgentMetrics>,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AgentSupervisor {
    /// Wires the agent runtime over the given broker and record bucket.
    ///
    /// Ensures the task stream exists so an agent can start before any
    /// gateway has published.
    pub async fn connect(
        cfg: AgentConfig,
        broker: Arc<dyn Broker>,
        kv: Arc<dyn KvBucket>,
        runner: RunnerRef,
        metrics: Arc<AgentMetrics>,
    ) -> Result<Arc<Self>, Error> {
        TaskPublisher::new(Arc::clone(&broker)).await?;

        let manager = InstanceManager::new(
            cfg.instances.clone(),
            cfg.pod_name.clone(),
            runner,
            Arc::clone(&metrics),
        );

        Ok(Arc::new(Self {
            store: TaskStore::new(kv),
            hints: HintClient::new(Arc::clone(&broker)),
            broker,
            manager,
            metrics,
            consumers: Mutex::new(HashMap::new()),
            cfg,
        }))
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Runs the hint loop until `token` fires, then shuts down gracefully.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), Error> {
        let hint_consumer = self
            .hints
            .subscribe(
                &self.cfg.pod_name,
                self.cfg.consumer.ack_wait,
                self.cfg.consumer.max_deliver,
                self.cfg.consumer.backoff.clone(),
            )
            .await?;

        info!(
            pod = %self.cfg.pod_name,
            max_instances = self.cfg.instances.max,
            "agent supervisor started",
        );

        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut empty_polls: u64 = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }

            let delivery = match hint_consumer.fetch(FETCH_WAIT).await {
                Ok(d) => d,
                Err(e) if e.is_no_messages() => {
                    empty_polls += 1;
                    if empty_polls % 100 == 0 {
                        debug!(pod = %self.cfg.pod_name, polls = empty_polls, "no hints");
                    }
                    continue;
                }
                Err(e) => {
                    warn!(pod = %self.cfg.pod_name, error = %e, "hint fetch failed");
                    continue;
                }
            };
            empty_polls = 0;

            match HintClient::decode(&delivery) {
                Ok(function) => {
                    info!(pod = %self.cfg.pod_name, function = %function, "hint received");
                    self.start_consumer(&token, function).await;
                }
                Err(e) => {
                    warn!(pod = %self.cfg.pod_name, error = %e, "malformed hint dropped");
                }
            }
            delivery.ack().await;
        }

        self.shutdown().await;
        Ok(())
    }

    /// Starts a consumer for `function` unless one is already running.
    async fn start_consumer(&self, token: &CancellationToken, function: FunctionName) {
        let mut consumers = self.consumers.lock().await;

        if let Some(handle) = consumers.get(function.as_str()) {
            if !handle.is_finished() {
                debug!(function = %function, "consumer already running, hint coalesced");
                return;
            }
        }

        let consumer = match FunctionConsumer::subscribe(
            Arc::clone(&self.broker),
            self.cfg.pod_name.clone(),
            function.clone(),
            self.cfg.consumer.clone(),
            self.store.clone(),
            Arc::clone(&self.manager),
            Arc::clone(&self.metrics),
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                error!(function = %function, error = %e, "cannot create function consumer");
                return;
            }
        };

        let handle = tokio::spawn(consumer.run(token.child_token()));
        consumers.insert(function.as_str().to_string(), handle);
    }

    /// Joins all consumers and stops the manager, bounded by the grace
    /// period. Consumer tokens are children of the runtime token, so they
    /// are already canceled when this runs.
    async fn shutdown(&self) {
        info!(pod = %self.cfg.pod_name, "agent shutting down");

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain().collect()
        };

        let deadline = Instant::now() + self.cfg.grace;
        for (function, mut handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                warn!(function = %function, "consumer did not stop within grace, aborting");
                handle.abort();
            }
        }

        self.manager.stop(self.cfg.grace).await;
        info!(pod = %self.cfg.pod_name, "agent stopped");
    }
}
