//! Impls - ports の実装（プロセス内）
//!
//! # 含まれる実装
//! - **InMemoryQueueRegistry**: 名前付きキュー（TaskQueue）
//! - **ResultRouter**: run ごとの応答配送（ResultSink）

pub mod inmem_queue;
pub mod result_router;

pub use self::inmem_queue::InMemoryQueueRegistry;
pub use self::result_router::ResultRouter;
