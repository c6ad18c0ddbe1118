//! Handler - worker が呼び出す object-safe な実行単位
//!
//! `TypedHandler<A>` が `Activity` を `DynHandler` に型消去し、
//! `HashMap<TaskName, Arc<dyn DynHandler>>` に格納できるようにします。

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use super::activity::Activity;
use crate::error::TaskError;

/// JSON in, JSON out. What the worker actually calls.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle(&self, input: Value) -> Result<Value, TaskError>;
}

pub struct TypedHandler<A: Activity> {
    activity: A,
}

impl<A: Activity> TypedHandler<A> {
    pub fn new(activity: A) -> Self {
        Self { activity }
    }
}

#[async_trait]
impl<A: Activity> DynHandler for TypedHandler<A> {
    async fn handle(&self, input: Value) -> Result<Value, TaskError> {
        let input: A::Input = serde_json::from_value(input)
            .map_err(|e| TaskError::permanent(format!("json decode: {e}")))?;
        let output = self.activity.run(input).await?;
        serde_json::to_value(output).map_err(|e| TaskError::permanent(format!("json encode: {e}")))
    }
}

/// Closure-backed handler. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure as a handler.
///
/// ```ignore
/// let echo = handler_fn(|input| async move { Ok(input) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    async fn handle(&self, input: Value) -> Result<Value, TaskError> {
        (self.f)(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Pair {
        left: i64,
        right: i64,
    }

    struct Add;

    #[async_trait]
    impl Activity for Add {
        type Input = Pair;
        type Output = i64;

        async fn run(&self, input: Pair) -> Result<i64, TaskError> {
            Ok(input.left + input.right)
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_encodes() {
        let handler = TypedHandler::new(Add);
        let out = handler.handle(json!({"left": 2, "right": 40})).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn bad_input_is_permanent() {
        let handler = TypedHandler::new(Add);
        let err = handler.handle(json!("not a pair")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.to_string().starts_with("json decode"));
    }

    #[tokio::test]
    async fn closure_handler_passes_through() {
        let handler = handler_fn(|input| async move { Ok::<_, TaskError>(json!({ "echo": input })) });
        let out = handler.handle(json!("hi")).await.unwrap();
        assert_eq!(out, json!({"echo": "hi"}));
    }
}
