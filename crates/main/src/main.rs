//! 主应用程序入口
//!
//! 加载配置、装配存储与实时总线，启动后台清理任务和 Axum Web API 服务。

use application::{PresenceSweeper, SweepPolicy};
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(storage = ?config.storage, "配置加载完成");

    let infrastructure = Infrastructure::connect(&config).await?;

    let sweeper = PresenceSweeper::new(infrastructure.deps.clone(), SweepPolicy::from(&config));
    let sweep_interval = config.sweep_interval();
    let sweep_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper.sweep().await {
                tracing::warn!(error = %err, "在线状态清理失败，等待下一轮");
            }
        }
    });

    let app = router(AppState::new(infrastructure.deps.clone(), &config));
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!("匿名聊天服务启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("收到退出信号，正在关闭");
        })
        .await?;

    sweep_task.abort();
    if let Some(pool) = infrastructure.pool {
        pool.close().await;
    }
    Ok(())
}
