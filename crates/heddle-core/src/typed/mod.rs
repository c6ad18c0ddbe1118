//! Typed - 型付き Activity API と handler table
//!
//! # 二層構造
//! - **表層（Typed）**: `Activity` trait - 入出力が型で決まる
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, JSON in / JSON out
//!
//! Worker は `HandlerTable` から task 名で `DynHandler` を引いて実行します。

pub mod activity;
pub mod handler;
pub mod table;

pub use self::activity::Activity;
pub use self::handler::{DynHandler, FnHandler, TypedHandler, handler_fn};
pub use self::table::HandlerTable;
