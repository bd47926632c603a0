//! Retry with error classification and step-based rollback pipelines.
//!
//! Operations against Proxmox and the node gateways fail in two distinct
//! ways: transient (connection reset, task lock held, config momentarily
//! missing after a clone) and fatal (bad credentials, refused delete).
//! Only the operation itself knows which is which, so everything returns
//! [`OpResult`] wrapping errors in [`OpError::Transient`] or
//! [`OpError::Fatal`], and the retry/pipeline layers act on that
//! classification.

use log::warn;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

/// An error that classifies itself as transient (retryable) or fatal.
#[derive(Debug)]
pub enum OpError<E> {
    /// A transient failure that may succeed on retry
    Transient(E),
    /// A fatal failure that should not be retried
    Fatal(E),
}

impl<E> OpError<E> {
    pub fn into_inner(self) -> E {
        match self {
            OpError::Transient(e) | OpError::Fatal(e) => e,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, OpError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, OpError::Fatal(_))
    }

    pub fn inner(&self) -> &E {
        match self {
            OpError::Transient(e) | OpError::Fatal(e) => e,
        }
    }

    pub fn map<F, U>(self, f: F) -> OpError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            OpError::Transient(e) => OpError::Transient(f(e)),
            OpError::Fatal(e) => OpError::Fatal(f(e)),
        }
    }
}

impl<E: fmt::Display> fmt::Display for OpError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::Transient(e) => write!(f, "transient error: {}", e),
            OpError::Fatal(e) => write!(f, "fatal error: {}", e),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for OpError<E> {}

/// Convenience alias that defaults the error to [`anyhow::Error`].
pub type OpResult<T, E = anyhow::Error> = Result<T, OpError<E>>;

#[macro_export]
macro_rules! op_fatal {
    ($msg:literal $(,)?) => {
        return Err($crate::retry::OpError::Fatal(anyhow::anyhow!($msg)))
    };
    ($err:expr $(,)?) => {
        return Err($crate::retry::OpError::Fatal(anyhow::anyhow!($err)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::retry::OpError::Fatal(anyhow::anyhow!($fmt, $($arg)*)))
    };
}

#[macro_export]
macro_rules! op_transient {
    ($msg:literal $(,)?) => {
        return Err($crate::retry::OpError::Transient(anyhow::anyhow!($msg)))
    };
    ($err:expr $(,)?) => {
        return Err($crate::retry::OpError::Transient(anyhow::anyhow!($err)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::retry::OpError::Transient(anyhow::anyhow!($fmt, $($arg)*)))
    };
}

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Minimum delay between retries
    pub min_delay: Duration,
    /// Maximum delay between retries (caps exponential backoff)
    pub max_delay: Duration,
    /// Maximum number of retry attempts (not counting the first attempt)
    pub max_retries: u32,
    /// Multiplier for exponential backoff (delay *= factor each attempt)
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 3,
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy for reads against a VM that was just cloned: Proxmox can
    /// report "does not exist" for several seconds while the clone task
    /// settles, so this polls patiently (10 attempts, 1.5x from 500ms).
    pub fn post_clone() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            factor: 1.5,
        }
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let clamped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }
}

/// Retry an async operation with the given policy.
///
/// Retries on [`OpError::Transient`] up to the configured limit and
/// short-circuits immediately on [`OpError::Fatal`]. The retry loop runs
/// inline, so borrowed references in the closure remain valid.
pub async fn retry_async<F, Fut, T, E>(policy: RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OpError<E>>>,
    E: fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(OpError::Fatal(e)) => return Err(e),
            Err(OpError::Transient(e)) => {
                if attempt >= policy.max_retries {
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "Transient error (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    policy.max_retries,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type StepFn<Ctx, E> = Box<dyn FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send>;

struct PipelineStep<Ctx, E> {
    name: String,
    action: StepFn<Ctx, E>,
    rollback: Option<StepFn<Ctx, E>>,
}

/// A pipeline of steps that execute in order with automatic rollback on
/// failure.
///
/// Each step is an `(action, rollback)` pair. If step N fails, rollbacks
/// for steps 0..N-1 run in reverse order. The pipeline operates on a
/// shared mutable context `Ctx` so later steps can read what earlier
/// steps produced, and the context is returned on success.
pub struct Pipeline<Ctx, E = anyhow::Error> {
    ctx: Ctx,
    steps: Vec<PipelineStep<Ctx, E>>,
}

impl<Ctx, E> Pipeline<Ctx, E>
where
    Ctx: Send + 'static,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    pub fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            steps: Vec::new(),
        }
    }

    /// Add a step with only an action (no rollback).
    pub fn step(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
    ) -> Self {
        self.steps.push(PipelineStep {
            name: name.into(),
            action: Box::new(action),
            rollback: None,
        });
        self
    }

    /// Add a step with both an action and a rollback.
    ///
    /// The rollback runs only if this step succeeded and a later step fails.
    pub fn step_with_rollback(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
        rollback: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
    ) -> Self {
        self.steps.push(PipelineStep {
            name: name.into(),
            action: Box::new(action),
            rollback: Some(Box::new(rollback)),
        });
        self
    }

    /// Execute all steps in order. On failure, rollback completed steps
    /// in reverse and return the original error.
    pub async fn execute(mut self) -> Result<Ctx, E> {
        let mut completed_rollbacks: Vec<StepFn<Ctx, E>> = Vec::new();

        let steps: Vec<PipelineStep<Ctx, E>> = self.steps.drain(..).collect();

        for step in steps {
            match (step.action)(&mut self.ctx).await {
                Ok(()) => {
                    if let Some(rollback) = step.rollback {
                        completed_rollbacks.push(rollback);
                    }
                }
                Err(e) => {
                    warn!(
                        "Pipeline step '{}' failed: {}, rolling back {} steps",
                        step.name,
                        e,
                        completed_rollbacks.len()
                    );

                    for rollback in completed_rollbacks.into_iter().rev() {
                        if let Err(rb_err) = (rollback)(&mut self.ctx).await {
                            warn!("Rollback failed: {}", rb_err);
                        }
                    }

                    return Err(e);
                }
            }
        }

        Ok(self.ctx)
    }
}

impl<Ctx, E> IntoFuture for Pipeline<Ctx, E>
where
    Ctx: Send + 'static,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    type Output = Result<Ctx, E>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.execute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_async_retries_on_transient_then_succeeds() {
        let counter = AtomicU32::new(0);

        let result: Result<&str, anyhow::Error> = retry_async(
            RetryPolicy::default().with_min_delay(Duration::from_millis(1)),
            || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(OpError::Transient(anyhow::anyhow!("transient failure")))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_async_stops_on_fatal() {
        let counter = AtomicU32::new(0);

        let result: Result<(), anyhow::Error> = retry_async(
            RetryPolicy::default().with_min_delay(Duration::from_millis(1)),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::Fatal(anyhow::anyhow!("fatal"))) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_async_exhausts_retries() {
        let counter = AtomicU32::new(0);

        let result: Result<(), anyhow::Error> = retry_async(
            RetryPolicy::default()
                .with_min_delay(Duration::from_millis(1))
                .with_max_retries(2),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::Transient(anyhow::anyhow!("always fails"))) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn post_clone_policy_backoff_grows() {
        let p = RetryPolicy::post_clone();
        assert_eq!(p.max_retries, 10);
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(750));
        assert!(p.delay_for_attempt(9) <= p.max_delay);
    }

    #[tokio::test]
    async fn pipeline_rollback_on_failure_runs_in_reverse() {
        let rolled_back = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
        let r1 = rolled_back.clone();
        let r2 = rolled_back.clone();

        let result = Pipeline::<(), anyhow::Error>::new(())
            .step_with_rollback(
                "step1",
                |_ctx| Box::pin(async { Ok(()) }),
                move |_ctx| {
                    let r = r1.clone();
                    Box::pin(async move {
                        r.lock().await.push("rollback1".into());
                        Ok(())
                    })
                },
            )
            .step_with_rollback(
                "step2",
                |_ctx| Box::pin(async { Ok(()) }),
                move |_ctx| {
                    let r = r2.clone();
                    Box::pin(async move {
                        r.lock().await.push("rollback2".into());
                        Ok(())
                    })
                },
            )
            .step("step3_fails", |_ctx| {
                Box::pin(async { Err(anyhow::anyhow!("boom")) })
            })
            .execute()
            .await;

        assert!(result.is_err());
        let rb = rolled_back.lock().await;
        assert_eq!(*rb, vec!["rollback2", "rollback1"]);
    }

    #[tokio::test]
    async fn pipeline_no_rollback_when_first_step_fails() {
        let rollback_ran = Arc::new(AtomicU32::new(0));
        let rr = rollback_ran.clone();

        let result = Pipeline::<(), anyhow::Error>::new(())
            .step_with_rollback(
                "step1_fails",
                |_ctx| Box::pin(async { Err(anyhow::anyhow!("immediate failure")) }),
                move |_ctx| {
                    let rr = rr.clone();
                    Box::pin(async move {
                        rr.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                },
            )
            .execute()
            .await;

        assert!(result.is_err());
        assert_eq!(rollback_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pipeline_context_flows_between_steps() {
        struct Ctx {
            value: u32,
        }

        let ctx = Pipeline::<Ctx, anyhow::Error>::new(Ctx { value: 0 })
            .step("set_value", |ctx| {
                Box::pin(async move {
                    ctx.value = 42;
                    Ok(())
                })
            })
            .step("double_value", |ctx| {
                Box::pin(async move {
                    ctx.value *= 2;
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(ctx.value, 84);
    }
}
