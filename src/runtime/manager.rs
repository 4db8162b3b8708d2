//! # Instance manager: the per-function pool.
//!
//! Keyed map `function name -> instance` behind a reader/writer lock, with
//! a global cap on live instances.
//!
//! ## Rules
//! - At most one instance per function name exists at any time.
//! - Acquisition is double-checked: read-lock fast path, write-lock
//!   re-check, then count live instances against the cap.
//! - The cold start runs under the write lock. That serializes creation,
//!   which is exactly what prevents a thundering herd of cold starts for
//!   the same function.
//! - Each instance's self-supervision task removes the map entry when it
//!   returns; expiry is garbage collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InstancesConfig;
use crate::error::Error;
use crate::metrics::AgentMetrics;
use crate::names::FunctionName;

use super::instance::{Instance, RunnerRef};

/// Pool of warm instances under a global cap.
pub struct InstanceManager {
    cfg: InstancesConfig,
    pod_name: String,
    runner: RunnerRef,
    metrics: Arc<AgentMetrics>,
    instances: Arc<RwLock<HashMap<String, Arc<Instance>>>>,
    supervision: Mutex<JoinSet<()>>,
    runtime_token: CancellationToken,
}

impl InstanceManager {
    pub fn new(
        cfg: InstancesConfig,
        pod_name: impl Into<String>,
        runner: RunnerRef,
        metrics: Arc<AgentMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            pod_name: pod_name.into(),
            runner,
            metrics,
            instances: Arc::new(RwLock::new(HashMap::new())),
            supervision: Mutex::new(JoinSet::new()),
            runtime_token: CancellationToken::new(),
        })
    }

    /// Returns the live instance for `function`, creating one if needed.
    ///
    /// Fails with [`Error::CapacityExceeded`] when the pool is at its cap;
    /// the consumer responds by naking so the broker redelivers after
    /// backoff.
    pub async fn acquire(&self, function: &FunctionName) -> Result<Arc<Instance>, Error> {
        {
            let instances = self.instances.read().await;
            if let Some(inst) = instances.get(function.as_str()) {
                if inst.is_alive() {
                    debug!(pod = %self.pod_name, function = %function, "reuse existing instance");
                    return Ok(Arc::clone(inst));
                }
            }
        }

        let mut instances = self.instances.write().await;

        // Double-checked: another acquirer may have won the write lock.
        if let Some(inst) = instances.get(function.as_str()) {
            if inst.is_alive() {
                return Ok(Arc::clone(inst));
            }
        }

        let alive = instances.values().filter(|i| i.is_alive()).count();
        if alive >= self.cfg.max {
            self.metrics
                .max_instances_reached
                .with_label_values(&[&self.pod_name])
                .inc();
            return Err(Error::CapacityExceeded { max: self.cfg.max });
        }

        info!(
            pod = %self.pod_name,
            function = %function,
            lifetime = ?self.cfg.lifetime,
            cold_start = ?self.cfg.cold_start,
            alive,
            "creating new instance",
        );

        let inst = Arc::new(
            Instance::start(
                Arc::clone(&self.runner),
                function.clone(),
                self.cfg.cold_start,
                self.cfg.lifetime,
            )
            .await,
        );
        instances.insert(function.as_str().to_string(), Arc::clone(&inst));

        self.metrics
            .instance_creations
            .with_label_values(&[&self.pod_name, function.as_str()])
            .inc();
        self.metrics
            .active_instances
            .with_label_values(&[&self.pod_name, function.as_str()])
            .set(1);
        self.metrics
            .total_instances
            .with_label_values(&[&self.pod_name])
            .set(instances.len() as i64);

        self.spawn_supervision(function.clone(), Arc::clone(&inst))
            .await;

        Ok(inst)
    }

    /// Spawns the instance's self-supervision task; when it returns, the
    /// map entry is removed and metrics are settled.
    async fn spawn_supervision(&self, function: FunctionName, inst: Arc<Instance>) {
        let instances = Arc::clone(&self.instances);
        let metrics = Arc::clone(&self.metrics);
        let pod_name = self.pod_name.clone();
        let token = self.runtime_token.child_token();

        self.supervision.lock().await.spawn(async move {
            Arc::clone(&inst).run(token).await;

            let mut map = instances.write().await;
            // A newer instance may already occupy the slot; only remove our own.
            let ours = map
                .get(function.as_str())
                .map(|cur| Arc::ptr_eq(cur, &inst))
                .unwrap_or(false);
            if ours {
                map.remove(function.as_str());
            }
            metrics
                .instance_deletions
                .with_label_values(&[&pod_name, function.as_str()])
                .inc();
            metrics
                .active_instances
                .with_label_values(&[&pod_name, function.as_str()])
                .set(0);
            metrics
                .total_instances
                .with_label_values(&[&pod_name])
                .set(map.len() as i64);
            debug!(pod = %pod_name, function = %function, "instance removed");
        });
    }

    /// Number of currently live instances.
    pub async fn live_count(&self) -> usize {
        let instances = self.instances.read().await;
        instances.values().filter(|i| i.is_alive()).count()
    }

    /// Stops every instance and waits for their supervision tasks to exit,
    /// bounded by `grace`. Leftovers are aborted; callers treat this as
    /// best-effort.
    pub async fn stop(&self, grace: Duration) {
        info!(pod = %self.pod_name, "manager stopping");
        {
            let instances = self.instances.read().await;
            for inst in instances.values() {
                inst.stop();
            }
        }
        self.runtime_token.cancel();

        let mut supervision = self.supervision.lock().await;
        let drained = timeout(grace, async {
            while supervision.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pod = %self.pod_name, "instance supervision exceeded grace; aborting");
            supervision.abort_all();
        }
        info!(pod = %self.pod_name, "manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SimulatedRunner;
    use prometheus::Registry;

    fn manager(max: usize, lifetime: Duration) -> Arc<InstanceManager> {
        let metrics = Arc::new(AgentMetrics::register(&Registry::new()).unwrap());
        InstanceManager::new(
            InstancesConfig {
                max,
                lifetime,
                cold_start: Duration::ZERO,
            },
            "pod-test",
            Arc::new(SimulatedRunner),
            metrics,
        )
    }

    fn function(slug: &str) -> FunctionName {
        FunctionName::parse(&format!("functions/{slug}")).unwrap()
    }

    #[tokio::test]
    async fn acquire_reuses_live_instance() {
        let mgr = manager(2, Duration::from_secs(5));
        let a = mgr.acquire(&function("a")).await.unwrap();
        let b = mgr.acquire(&function("a")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.live_count().await, 1);
    }

    #[tokio::test]
    async fn cap_is_enforced() {
        let mgr = manager(1, Duration::from_secs(5));
        mgr.acquire(&function("a")).await.unwrap();

        let err = mgr.acquire(&function("b")).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 1 }));
        assert_eq!(mgr.live_count().await, 1);
    }

    #[tokio::test]
    async fn expiry_frees_capacity() {
        let mgr = manager(1, Duration::from_millis(30));
        mgr.acquire(&function("a")).await.unwrap();

        // Once a's instance expires, b fits.
        tokio::time::sleep(Duration::from_millis(80)).await;
        mgr.acquire(&function("b")).await.unwrap();
        assert_eq!(mgr.live_count().await, 1);
    }

    #[tokio::test]
    async fn stopped_instance_is_replaced() {
        let mgr = manager(2, Duration::from_secs(5));
        let a = mgr.acquire(&function("a")).await.unwrap();
        a.stop();

        let again = mgr.acquire(&function("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &again));
        assert!(again.is_alive());
    }

    #[tokio::test]
    async fn stop_is_bounded_and_kills_all() {
        let mgr = manager(4, Duration::from_secs(60));
        mgr.acquire(&function("a")).await.unwrap();
        mgr.acquire(&function("b")).await.unwrap();

        mgr.stop(Duration::from_secs(1)).await;
        assert_eq!(mgr.live_count().await, 0);
    }
}
