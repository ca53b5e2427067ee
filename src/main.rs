//! Reach - 逐条外联会话引擎
//!
//! 入口：加载配置、初始化日志，组装存储 / 事件总线 / 草拟 / 操作层与编排器，
//! 恢复上次遗留的会话，然后启动 HTTP + WebSocket 服务直到收到关闭信号。
//!
//! 用法：`reach [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reach::actuation::create_actuator_factory;
use reach::config::load_config;
use reach::core::{
    Orchestrator, SessionLoopsCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use reach::gateway::{build_router, EventBus};
use reach::llm::DraftingService;
use reach::observability;
use reach::store::create_record_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    observability::init();

    let store = create_record_store(cfg.store.db_path.as_deref()).await;
    let bus = EventBus::new(cfg.server.event_buffer);
    let drafting = DraftingService::from_config(&cfg.llm);
    if cfg.llm.resolve_api_key().is_none() {
        tracing::warn!("No LLM credential configured; messages use the built-in template unless a session supplies a key");
    }
    let actuators = create_actuator_factory(&cfg.browser);

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        bus,
        actuators,
        drafting,
        cfg.session.clone(),
    ));
    orchestrator
        .recover()
        .await
        .context("Failed to recover interrupted sessions")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let app = build_router(Arc::clone(&orchestrator), cfg.server.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind_addr))?;
    tracing::info!(
        "{} listening on http://{}",
        cfg.app.name.as_deref().unwrap_or("reach"),
        cfg.server.bind_addr
    );

    let signal = Arc::clone(&shutdown);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
        .await;
    if let Err(e) = &served {
        shutdown.shutdown(ShutdownReason::Fatal(e.to_string()));
    }

    let mut coordinator = ShutdownCoordinator::new(
        cfg.session.stop_grace() + Duration::from_secs(1),
    );
    coordinator.register(SessionLoopsCleanup::new(orchestrator));
    coordinator.run_cleanup().await;

    served.context("HTTP server failed")?;
    tracing::info!("Shutdown complete");
    Ok(())
}
