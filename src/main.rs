mod artifacts;
mod capability;
mod cleanup;
mod command;
mod config;
mod crash;
mod engine;
mod error;
mod health;
mod monitor;
mod persistence;
mod process;
mod state;
mod stream;
mod stream_log;
mod web;

use axum::{
    routing::{get, post},
    Router,
};
use capability::EncoderDiscovery;
use clap::Parser;
use command::BuildContext;
use config::AppConfig;
use engine::Engine;
use error::ConfigError;
use state::SharedState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stream Warden - 转码进程监管服务
/// 解析命令行参数，加载配置，恢复上次运行的流，并启动HTTP服务及后台任务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "stream-warden.yaml")]
    config: String,

    /// 启动时不恢复持久化的流
    #[arg(long)]
    no_restore: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // 加载并校验配置
    let config = AppConfig::load(&args.config)?;
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(ConfigError::Invalid(problems).into());
    }
    config
        .paths
        .ensure_dirs()
        .map_err(|source| ConfigError::RuntimeDir {
            path: config.paths.base_dir.display().to_string(),
            source,
        })?;
    info!(
        "Stream Warden initialized. Runtime dir: {}",
        config.paths.base_dir.display()
    );

    let ctx = BuildContext::from_config(&config.server);
    if config.server.use_time_limiter && ctx.time_limiter.is_none() {
        warn!("No timeout binary found; durations are enforced by the monitor only");
    }
    let discovery = EncoderDiscovery::new(&config.server);
    let state: SharedState = Engine::new(config.clone(), ctx, discovery, process::host());

    // 预热编码器探测
    let caps = state.discovery().capabilities().await;
    info!("Available codecs: {:?}", caps.codecs().collect::<Vec<_>>());

    // 启动后台任务
    let background = CancellationToken::new();
    tokio::spawn(health::run_health_monitor(state.clone(), background.clone()));
    tokio::spawn(cleanup::run_cleanup_loop(state.clone(), background.clone()));

    if !args.no_restore {
        let summary = persistence::restore_all(&state).await;
        info!(
            "Restore: {} restored, {} failed, {} skipped",
            summary.restored, summary.failed, summary.skipped
        );
    }

    // 注册HTTP路由
    let app = Router::new()
        .route("/sys/status", get(web::admin::sys_status)) // 系统状态
        .route(
            "/streams",
            get(web::admin::list_streams).post(web::admin::handle_start),
        )
        .route("/streams/cleanup_stale", post(web::admin::cleanup_stale))
        .route("/streams/:name/stop", post(web::admin::handle_stop))
        .route("/persistent_streams", get(web::admin::list_persistent))
        .route(
            "/persistent_streams/restore",
            post(web::admin::restore_persistent),
        )
        .route(
            "/persistent_streams/clear",
            post(web::admin::clear_persistent),
        )
        .route("/encoders", get(web::admin::encoders))
        .with_state(state.clone());

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // 停止后台任务并关停所有流，持久化条目保留以便下次恢复
    background.cancel();
    state.shutdown().await;
    info!("Stream Warden stopped");

    Ok(())
}
