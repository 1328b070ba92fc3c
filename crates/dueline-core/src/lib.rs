//! dueline-core
//!
//! Deferred task pipeline: tasks are accepted with an execution instant,
//! kept in a durable store, promoted onto a delivery queue once due, and run
//! by workers.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, status の状態遷移, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, ReadyIndex, DeliveryQueue, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（ingest, dispatcher, reconciler, worker_loop, builder）
//! - **typed**: 型付き Task API（TypedTask trait, Handler trait, PayloadCodec）
//! - **impls**: 実装（in-memory、feature `redis` で Redis）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;
