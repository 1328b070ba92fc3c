//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / InMemoryReadyIndex / InMemoryDeliveryQueue**:
//!   テスト・standalone 用（プロセス内で完結）
//! - **redis**（feature `redis`）: 本番用。3 つの ports すべてを Redis で実装

pub mod inmem_delivery;
pub mod memory_index;
pub mod memory_store;

#[cfg(feature = "redis")]
pub mod redis;

// 主要な型を再エクスポート
pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::memory_index::InMemoryReadyIndex;
pub use self::memory_store::InMemoryTaskStore;
