//! # Function instance: a warm in-process executor.
//!
//! An [`Instance`] is a cold-started executor bound to one function. It is
//! alive from the end of its cold start until its configured lifetime
//! elapses or [`Instance::stop`] fires the done-signal, whichever comes
//! first.
//!
//! ## Rules
//! - `start` blocks for the cold-start delay, then stamps
//!   `expires_at = now + lifetime`.
//! - `run` is the self-supervision loop: it waits for expiry, stop, or the
//!   governing token, then fires the done-signal and returns.
//! - `stop` is idempotent.
//! - `execute` fails fast when the instance is not alive, otherwise races
//!   the runner against the caller's token and the done-signal. Multiple
//!   executes may run concurrently against one instance; the in-flight
//!   ceiling lives at the consumer layer, not here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::TaskAssignment;
use crate::names::FunctionName;

/// # Errors produced by one task execution attempt.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ExecError {
    /// The instance was already expired or stopped at entry.
    #[error("instance is not alive")]
    NotAlive,

    /// The instance's done-signal fired mid-execution.
    #[error("instance stopped")]
    Stopped,

    /// The caller's context was canceled mid-execution.
    #[error("context canceled")]
    Canceled,

    /// The execution ran past its deadline.
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The runner reported a failure.
    #[error("execution failed: {reason}")]
    Failed { reason: String },
}

impl ExecError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ExecError::NotAlive => "not_alive",
            ExecError::Stopped => "stopped",
            ExecError::Canceled => "canceled",
            ExecError::Timeout { .. } => "timeout",
            ExecError::Failed { .. } => "failed",
        }
    }
}

/// Pluggable execution backend.
///
/// The agent treats function code as opaque: it routes assignments to a
/// runner and records the outcome. Sandboxing, bundles, and interpreters
/// live behind this trait.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Runs one assignment to completion.
    ///
    /// Cancellation is by drop: the instance races this future against the
    /// caller's token and the done-signal.
    async fn invoke(&self, assignment: &TaskAssignment) -> Result<Vec<u8>, String>;
}

/// Shared handle to a runner.
pub type RunnerRef = Arc<dyn Runner>;

/// Runner that sleeps the assignment's `execution_time` and returns `OK`.
///
/// Stands in for real function execution in demos and tests.
pub struct SimulatedRunner;

#[async_trait]
impl Runner for SimulatedRunner {
    async fn invoke(&self, assignment: &TaskAssignment) -> Result<Vec<u8>, String> {
        sleep(assignment.execution_time).await;
        Ok(b"OK".to_vec())
    }
}

/// A warm executor for one function.
pub struct Instance {
    function: FunctionName,
    runner: RunnerRef,
    created_at: Instant,
    expires_at: Instant,
    done: CancellationToken,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("function", &self.function)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Instance {
    /// Cold-starts an instance: blocks for `cold_start`, then returns with
    /// `expires_at = now + lifetime`.
    pub async fn start(
        runner: RunnerRef,
        function: FunctionName,
        cold_start: Duration,
        lifetime: Duration,
    ) -> Self {
        sleep(cold_start).await;
        let now = Instant::now();
        Self {
            function,
            runner,
            created_at: now,
            expires_at: now + lifetime,
            done: CancellationToken::new(),
        }
    }

    pub fn function(&self) -> &FunctionName {
        &self.function
    }

    /// Returns `true` while the lifetime has not elapsed and the
    /// done-signal has not fired.
    pub fn is_alive(&self) -> bool {
        !self.done.is_cancelled() && Instant::now() < self.expires_at
    }

    /// The done-signal; observers stop using the instance once it fires.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Fires the done-signal. Idempotent.
    pub fn stop(&self) {
        if !self.done.is_cancelled() {
            debug!(function = %self.function, "instance stopped");
            self.done.cancel();
        }
    }

    /// Self-supervision loop: waits for lifetime expiry, a stop, or `ctx`,
    /// then fires the done-signal.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) {
        info!(
            function = %self.function,
            lifetime = ?self.expires_at.duration_since(self.created_at),
            "instance started",
        );

        tokio::select! {
            _ = ctx.cancelled() => {
                debug!(function = %self.function, "instance context canceled");
            }
            _ = self.done.cancelled() => {}
            _ = sleep_until(self.expires_at) => {
                info!(function = %self.function, "instance lifetime ended");
            }
        }
        self.done.cancel();
    }

    /// Executes one assignment.
    ///
    /// Returns the runner's output, or:
    /// - [`ExecError::NotAlive`] when the instance is dead at entry;
    /// - [`ExecError::Canceled`] when `ctx` fires first;
    /// - [`ExecError::Stopped`] when the done-signal fires first.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        assignment: &TaskAssignment,
    ) -> Result<Vec<u8>, ExecError> {
        if !self.is_alive() {
            return Err(ExecError::NotAlive);
        }

        tokio::select! {
            res = self.runner.invoke(assignment) => {
                res.map_err(|reason| ExecError::Failed { reason })
            }
            _ = ctx.cancelled() => Err(ExecError::Canceled),
            _ = self.done.cancelled() => Err(ExecError::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn assignment(ms: u64) -> TaskAssignment {
        TaskAssignment {
            task_id: Uuid::new_v4(),
            function_id: FunctionName::parse("functions/foo").unwrap(),
            execution_time: Duration::from_millis(ms),
        }
    }

    async fn warm_instance(lifetime: Duration) -> Instance {
        Instance::start(
            Arc::new(SimulatedRunner),
            FunctionName::parse("functions/foo").unwrap(),
            Duration::ZERO,
            lifetime,
        )
        .await
    }

    #[tokio::test]
    async fn execute_returns_runner_output() {
        let inst = warm_instance(Duration::from_secs(5)).await;
        let ctx = CancellationToken::new();
        let out = inst.execute(&ctx, &assignment(5)).await.unwrap();
        assert_eq!(out, b"OK");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_kills_liveness() {
        let inst = warm_instance(Duration::from_secs(5)).await;
        assert!(inst.is_alive());
        inst.stop();
        inst.stop();
        assert!(!inst.is_alive());

        let ctx = CancellationToken::new();
        assert!(matches!(
            inst.execute(&ctx, &assignment(5)).await,
            Err(ExecError::NotAlive)
        ));
    }

    #[tokio::test]
    async fn context_cancel_interrupts_execution() {
        let inst = Arc::new(warm_instance(Duration::from_secs(5)).await);
        let ctx = CancellationToken::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert!(matches!(
            inst.execute(&ctx, &assignment(5_000)).await,
            Err(ExecError::Canceled)
        ));
    }

    #[tokio::test]
    async fn stop_interrupts_execution() {
        let inst = Arc::new(warm_instance(Duration::from_secs(5)).await);
        let ctx = CancellationToken::new();

        let stopper = Arc::clone(&inst);
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            stopper.stop();
        });

        assert!(matches!(
            inst.execute(&ctx, &assignment(5_000)).await,
            Err(ExecError::Stopped)
        ));
    }

    #[tokio::test]
    async fn lifetime_expiry_fires_done() {
        let inst = Arc::new(warm_instance(Duration::from_millis(20)).await);
        let ctx = CancellationToken::new();

        let supervision = tokio::spawn(Arc::clone(&inst).run(ctx));
        supervision.await.unwrap();
        assert!(inst.done().is_cancelled());
        assert!(!inst.is_alive());
    }
}
