//! Demo activities.

use std::time::Duration;

use async_trait::async_trait;
use heddle_core::{Activity, TaskError};
use serde::{Deserialize, Serialize};
use tracing::info;

pub struct SayHello;

#[async_trait]
impl Activity for SayHello {
    type Input = String;
    type Output = String;

    async fn run(&self, name: String) -> Result<String, TaskError> {
        let message = format!("Hello, {name}!");
        info!(%message, "say_hello");
        Ok(message)
    }
}

/// Reacts to a greeting by the parity of its last digit.
pub struct SayHi;

pub fn reaction(greeting: &str) -> Result<&'static str, TaskError> {
    let last = greeting
        .chars()
        .filter_map(|c| c.to_digit(10))
        .last()
        .ok_or_else(|| TaskError::permanent(format!("no digits in {greeting:?}")))?;
    Ok(if last % 2 == 0 { "hi" } else { "what's up" })
}

#[async_trait]
impl Activity for SayHi {
    type Input = String;
    type Output = String;

    async fn run(&self, greeting: String) -> Result<String, TaskError> {
        reaction(&greeting).map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeInput {
    pub source: String,
    pub value: String,
    /// Artificial latency, for showing that joins ignore completion order.
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labeled {
    pub source: String,
    pub value: String,
}

pub struct Describe;

#[async_trait]
impl Activity for Describe {
    type Input = DescribeInput;
    type Output = Labeled;

    async fn run(&self, input: DescribeInput) -> Result<Labeled, TaskError> {
        if input.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(input.delay_ms)).await;
        }
        Ok(Labeled {
            source: input.source,
            value: input.value,
        })
    }
}

pub struct RenderJoin;

#[async_trait]
impl Activity for RenderJoin {
    type Input = Vec<Labeled>;
    type Output = String;

    async fn run(&self, items: Vec<Labeled>) -> Result<String, TaskError> {
        let parts: Vec<String> = items
            .iter()
            .map(|item| format!("{} from {}", item.value, item.source))
            .collect();
        Ok(format!("D received: {}", parts.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[tokio::test]
    async fn say_hello_greets() {
        assert_eq!(SayHello.run("World-42".into()).await.unwrap(), "Hello, World-42!");
    }

    #[rstest]
    #[case("Hello, World-2!", "hi")]
    #[case("Hello, World-3!", "what's up")]
    #[case("Hello, World-42!", "hi")]
    #[case("Hello, World-7!", "what's up")]
    #[tokio::test]
    async fn say_hi_follows_last_digit(#[case] greeting: &str, #[case] expected: &str) {
        assert_eq!(SayHi.run(greeting.to_string()).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn say_hi_without_digits_is_permanent() {
        let err = SayHi.run("Hello, World!".into()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn render_join_keeps_item_order() {
        let items = vec![
            Labeled { source: "A".into(), value: "apples".into() },
            Labeled { source: "B".into(), value: "bananas".into() },
        ];
        assert_eq!(
            RenderJoin.run(items).await.unwrap(),
            "D received: apples from A, bananas from B"
        );
    }
}
