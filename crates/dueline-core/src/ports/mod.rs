//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（Redis など）へのインターフェースを提供し、
//! 実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - ReadyIndex は due 時刻順の射影（task_id + スコア）
//! - DeliveryQueue は配送キュー（task_id のみ）
//! - 3 つをまたぐトランザクションはない。部分失敗は app 層で扱う

pub mod clock;
pub mod delivery_queue;
pub mod id_generator;
pub mod ready_index;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::{DeadLetter, Delivery, DeliveryQueue, QueueDepth};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ready_index::{ReadyEntry, ReadyIndex};
pub use self::task_store::{PendingCursor, StatusCounts, TaskStore};
