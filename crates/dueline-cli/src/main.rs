//! dueline - deferred task pipeline
//!
//! # ロール
//! - `api`: HTTP で投入を受け付ける（TaskStore + ReadyIndex に書く）
//! - `dispatcher`: due なタスクを DeliveryQueue に昇格し、Reconciler も回す
//! - `worker`: 配送を受けて handler を実行する
//! - `standalone`: 上の 3 つを in-memory backend で 1 プロセスにまとめる
//!
//! `api` / `dispatcher` / `worker` は Redis を使い、起動時の接続は
//! `connect_with_retry` で固定回数だけリトライする。
//!
//! worker の consumer 名はデフォルトでプロセスごとに一意。停止した worker の
//! in-flight 配送を戻すときは、同じ `--consumer` に `--recover` を付けて起動する。

mod args;
mod demo;
mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dueline_core::app::{App, AppBuilder, PipelineConfig, connect_with_retry};
use dueline_core::impls::redis::{
    self, KeySpace, RedisDeliveryQueue, RedisReadyIndex, RedisTaskStore,
};
use dueline_core::ports::DeliveryQueue;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::args::{BackendArgs, Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.pipeline.config();
    match cli.command {
        Command::Api { listen } => {
            let app = redis_app(&cli.backend, config, "api").await?;
            run_api(Arc::new(app), listen).await
        }
        Command::Dispatcher => {
            let app = redis_app(&cli.backend, config, "dispatcher").await?;
            run_dispatcher(Arc::new(app)).await
        }
        Command::Worker { consumer, recover } => {
            let consumer = consumer.unwrap_or_else(args::default_consumer);
            let app = redis_app(&cli.backend, config, &consumer).await?;
            run_worker(Arc::new(app), recover).await
        }
        Command::Standalone { listen } => {
            let app = demo::register(AppBuilder::new().in_memory())?
                .config(config)
                .build()?;
            run_standalone(Arc::new(app), listen).await
        }
    }
}

/// Connect the three Redis backends and wire them with the demo handlers.
async fn redis_app(
    backend: &BackendArgs,
    config: PipelineConfig,
    consumer: &str,
) -> anyhow::Result<App> {
    let retry = backend.startup_retry();
    let keys = KeySpace::new(backend.key_prefix.as_str());

    let store_url = backend.store_url();
    let store_conn = connect_with_retry("task store", retry, || redis::connect(store_url)).await?;
    let index_url = backend.index_url();
    let index_conn = connect_with_retry("ready index", retry, || redis::connect(index_url)).await?;
    let queue_url = backend.queue_url();
    let queue_conn =
        connect_with_retry("delivery queue", retry, || redis::connect(queue_url)).await?;
    tracing::info!(prefix = keys.prefix(), consumer, "connected to redis");

    let mut queue = RedisDeliveryQueue::new(queue_conn, keys.clone(), consumer);
    if let Some((replicas, timeout)) = backend.replica_ack() {
        queue = queue.with_replica_ack(replicas, timeout);
    }

    let builder = AppBuilder::new()
        .store(Arc::new(RedisTaskStore::new(store_conn, keys.clone())))
        .index(Arc::new(RedisReadyIndex::new(index_conn, keys)))
        .queue(Arc::new(queue))
        .config(config);
    Ok(demo::register(builder)?.build()?)
}

async fn run_api(app: Arc<App>, listen: SocketAddr) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve(app, listen, shutdown_rx));
    shutdown_signal().await;
    shutdown_tx.send_replace(true);
    server.await?
}

async fn run_dispatcher(app: Arc<App>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = app.dispatcher();
    let reconciler = app.reconciler();
    let dispatch = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { dispatcher.run(shutdown).await }
    });
    let reconcile = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    shutdown_signal().await;
    shutdown_tx.send_replace(true);
    dispatch.await?;
    reconcile.await?;
    Ok(())
}

async fn run_worker(app: Arc<App>, recover: bool) -> anyhow::Result<()> {
    if recover {
        let recovered = app
            .queue()
            .recover()
            .await
            .context("recovering in-flight deliveries")?;
        tracing::info!(recovered, "returned in-flight deliveries to the queue");
    }

    let workers = app.spawn_workers();
    tracing::info!(workers = workers.len(), "workers running");
    shutdown_signal().await;

    let report = workers.shutdown_and_join(app.config().shutdown_grace).await;
    tracing::info!(finished = report.finished, aborted = report.aborted, "workers stopped");
    Ok(())
}

async fn run_standalone(app: Arc<App>, listen: SocketAddr) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve(app.clone(), listen, shutdown_rx.clone()));
    let dispatcher = app.dispatcher();
    let dispatch = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { dispatcher.run(shutdown).await }
    });
    let reconciler = app.reconciler();
    let reconcile = tokio::spawn(async move { reconciler.run(shutdown_rx).await });
    let workers = app.spawn_workers();

    shutdown_signal().await;
    shutdown_tx.send_replace(true);

    let report = workers.shutdown_and_join(app.config().shutdown_grace).await;
    dispatch.await?;
    reconcile.await?;
    server.await??;

    let view = app.status().await?;
    tracing::info!(
        finished = report.finished,
        aborted = report.aborted,
        pending = view.tasks.pending,
        completed = view.tasks.completed,
        failed = view.tasks.failed,
        "standalone stopped"
    );
    Ok(())
}

async fn serve(
    app: Arc<App>,
    listen: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "api listening");

    axum::serve(listener, http::router(app))
        .with_graceful_shutdown(async move {
            // sender dropped counts as shutdown too
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}
