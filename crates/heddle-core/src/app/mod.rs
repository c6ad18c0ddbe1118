//! App - アプリケーション層
//!
//! ports を組み合わせて、run の実行と worker の管理を実装します。
//!
//! # 主要コンポーネント
//! - **HeddleBuilder / App**: 構築・起動時検証
//! - **Orchestrator**: run の投入と待機（run ごとに coordinator タスクを 1 つ）
//! - **Worker**: dequeue → execute → report のループ
//! - **Supervisor / PoolHandle**: worker の監視と再起動
//! - **InProcessLauncher / CommandLauncher**: worker の起動方法

pub mod builder;
mod coordinator;
pub mod launcher;
pub mod orchestrator;
pub mod supervisor;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::{App, BuildError, HeddleBuilder};
pub use self::launcher::{
    CommandLauncher, InProcessLauncher, WorkerExit, WorkerLauncher, WorkerProcess,
};
pub use self::orchestrator::Orchestrator;
pub use self::supervisor::{PoolHandle, ShutdownReport, Supervisor};
pub use self::worker::Worker;
