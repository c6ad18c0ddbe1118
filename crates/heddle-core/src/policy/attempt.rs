//! Executing a handler under a timeout, once or with retries.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::retry::{Decision, RetryPolicy};
use crate::error::TaskError;
use crate::typed::DynHandler;

/// Runs the handler once.
///
/// Past `timeout` the handler future is dropped and the attempt is a `Timeout`.
/// A panic inside the handler is caught and reported as `Permanent`.
pub async fn execute_attempt(
    handler: &dyn DynHandler,
    input: Value,
    timeout: Duration,
) -> Result<Value, TaskError> {
    let call = AssertUnwindSafe(handler.handle(input)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(TaskError::timeout(timeout)),
        Ok(Err(panic)) => Err(TaskError::permanent(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Ok(Ok(result)) => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Final outcome of [`run_with_retries`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSummary {
    pub attempts: u32,
    pub result: Result<Value, TaskError>,
}

/// Attempt, decide, back off, repeat. In-process; the orchestrator does the same
/// across workers with queues in between.
pub async fn run_with_retries(
    handler: &dyn DynHandler,
    input: Value,
    policy: &RetryPolicy,
    timeout: Duration,
) -> AttemptSummary {
    let mut attempt = 1;
    loop {
        let result = execute_attempt(handler, input.clone(), timeout).await;
        let error = match result {
            Ok(value) => {
                return AttemptSummary {
                    attempts: attempt,
                    result: Ok(value),
                };
            }
            Err(error) => error,
        };

        match policy.decide(attempt, &error) {
            Decision::Retry {
                next_attempt,
                delay,
            } => {
                warn!(attempt, next_attempt, ?delay, error = %error, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt = next_attempt;
            }
            Decision::Fail { reason } => {
                debug!(attempt, %reason, "giving up");
                return AttemptSummary {
                    attempts: attempt,
                    result: Err(error),
                };
            }
        }
    }
}
