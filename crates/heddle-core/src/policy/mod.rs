//! Retry and timeout policy engine.

pub mod attempt;
pub mod retry;

pub use attempt::{AttemptSummary, execute_attempt, run_with_retries};
pub use retry::{Backoff, DEFAULT_MAX_ATTEMPTS, Decision, Jitter, RetryPolicy};
