//! Ports - 抽象化レイヤー
//!
//! Orchestrator と worker はこの trait 越しにだけ通信します。
//! 現在の実装は in-memory（`impls`）のみですが、プロセス間の配送に
//! 差し替えられるよう、payload はすべて serde 対応にしています。

pub mod queue;
pub mod results;

pub use self::queue::TaskQueue;
pub use self::results::ResultSink;
