//! Typed - 型付き Task API
//!
//! task_type の typo を型で排除し、Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `TypedTask` trait, `Handler<T>` trait - 型安全
//! - **内部（bytes）**: `app::TaskHandler` - object-safe。`TypedHandler` が橋渡し

pub mod codec;
pub mod handler;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::codec::{CodecError, PayloadCodec};
pub use self::handler::{Handler, TypedHandler};
pub use self::task::TypedTask;
