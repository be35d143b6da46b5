mod common;
mod http_client;
mod model;
mod relay;
mod usage;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use model::arg::Args;
use model::config::Config;
use relay::{AppState, RelaySettings, UpstreamClient};
use tracing_subscriber::EnvFilter;
use usage::UsageLog;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(args).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let mut config = Config::load(&config_path)
        .with_context(|| format!("加载配置失败: {}", config_path))?;
    args.apply(&mut config);
    if let Some(path) = config.config_path() {
        tracing::info!("配置文件: {}", path.display());
    }

    if config.effective_api_key().is_none() {
        tracing::warn!("未配置 apiKey，所有接口无需认证");
    }

    let upstream = UpstreamClient::from_config(&config)?;
    if upstream.check_health().await {
        tracing::info!("推理服务可用: {}", upstream.base_url());
    } else {
        // 不阻止启动，流式请求会降级为提示消息
        tracing::warn!("推理服务暂不可用: {}", upstream.base_url());
    }

    let app = build_app(&config, upstream);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;
    tracing::info!("启动 llama-relay 服务: http://{}", addr);
    tracing::info!("用量日志目录: {}", config.usage_log_dir.display());
    tracing::info!("可用 API:");
    tracing::info!("  POST /stream");
    tracing::info!("  POST /completion");
    tracing::info!("  GET  /stats");
    tracing::info!("  GET  /health");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("服务已停止");
    Ok(())
}

/// 组装所有路由
fn build_app(config: &Config, upstream: UpstreamClient) -> Router {
    let api_key = config.effective_api_key();
    let usage = Arc::new(UsageLog::new(&config.usage_log_dir));
    let settings = RelaySettings {
        flush_interval: config.flush_interval(),
        idle_timeout: config.stream_idle_timeout(),
        fallback_message: config.fallback_message.clone(),
    };
    let state = AppState::new(upstream, usage.clone(), settings).with_api_key(api_key);

    relay::create_relay_router(state, config.max_body_bytes)
        .merge(usage::create_usage_router(api_key.map(String::from), usage))
        .layer(relay::cors_layer())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，正在关闭");
}
