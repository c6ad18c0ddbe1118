//! Activity trait - 型付きの処理単位

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::TaskError;

/// A unit of work with typed input and output.
///
/// ```ignore
/// struct SayHello;
///
/// #[async_trait]
/// impl Activity for SayHello {
///     type Input = String;
///     type Output = String;
///
///     async fn run(&self, name: String) -> Result<String, TaskError> {
///         Ok(format!("Hello, {name}!"))
///     }
/// }
/// ```
///
/// Register it under a task name with `HandlerTable::register_activity`.
/// Decoding the input or encoding the output failing is a `Permanent` error.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    type Input: DeserializeOwned + Send;
    type Output: Serialize + Send;

    async fn run(&self, input: Self::Input) -> Result<Self::Output, TaskError>;
}
