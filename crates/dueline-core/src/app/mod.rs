//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてパイプラインの各ロールを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **Ingestor**: 受け付け（TaskStore → ReadyIndex）
//! - **Dispatcher**: due なタスクを DeliveryQueue へ昇格
//! - **Reconciler**: ReadyIndex への書き込み漏れを回収
//! - **Worker / WorkerGroup**: 配送を受けて handler を実行
//! - **Runtime**: task_type → handler の解決と timeout
//! - **StatusView**: 件数の集計

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod ingest;
pub mod reconciler;
pub mod retry;
pub mod runtime;
pub mod startup;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::config::PipelineConfig;
pub use self::dispatcher::{Dispatcher, TickReport};
pub use self::ingest::{Ingestor, Receipt};
pub use self::reconciler::Reconciler;
pub use self::retry::RetryPolicy;
pub use self::runtime::{HandlerRegistry, RegistryError, Runtime, TaskHandler};
pub use self::startup::{StartupRetry, connect_with_retry};
pub use self::status::StatusView;
pub use self::worker_loop::{ShutdownReport, WorkOutcome, Worker, WorkerGroup};
