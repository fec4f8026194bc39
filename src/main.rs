mod capture;
mod config;
mod deadline;
mod engine;
mod error;
mod fleet;
mod motion;
mod policy;
mod session;
mod state;
mod supervisor;
mod web;

use axum::{
    routing::{get, post},
    Router,
};
use capture::FfmpegCapture;
use clap::Parser;
use config::AppConfig;
use engine::Engine;
use state::AppState;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// VTX Motion - RTSP Motion Recorder
/// 解析命令行参数，加载配置文件，启动相机会话、HTTP 管理接口及后台监控
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-motion.yaml")]
    config: String,

    /// 只启动指定的相机 (可重复)，默认启动所有 auto_start 相机
    #[arg(long)]
    camera: Vec<String>,

    /// 只提供 HTTP 接口，不自动启动任何相机
    #[arg(long)]
    serve_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info 级别，可通过 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // 加载并校验配置文件
    let config = AppConfig::load(&args.config)?;
    info!(
        "VTX Motion initialized. Base dir: {}, {} camera(s) configured",
        config.server.base_dir,
        config.cameras.len()
    );

    // 准备工作目录，清理上次运行遗留的临时片段
    let temp_root = config.server.temp_root();
    if config.server.clean_temp_on_start && temp_root.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&temp_root).await {
            warn!("Failed to clean temp directory {:?}: {}", temp_root, e);
        }
    }
    tokio::fs::create_dir_all(&temp_root).await?;
    tokio::fs::create_dir_all(config.server.records_root()).await?;

    let capture = Arc::new(FfmpegCapture::new(
        config.server.ffmpeg_binary.clone(),
        config.server.ffprobe_binary.clone(),
    ));
    let state = Arc::new(AppState::new(config.clone(), capture));

    // 启动相机
    if !args.serve_only {
        let started = if args.camera.is_empty() {
            Engine::start_auto(&state).await?
        } else {
            Engine::start_cameras(&state, args.camera.clone()).await?
        };
        info!("Started camera(s): {:?}", started);
    }

    // 启动后台监控程序
    tokio::spawn(supervisor::start_supervisor(
        state.clone(),
        config.server.supervisor_interval_ms,
    ));

    // 注册HTTP路由
    let app = Router::new()
        .route("/sys/status", get(web::admin::sys_status)) // 系统状态
        .route("/cameras", get(web::admin::list_cameras)) // 相机列表
        .route("/cameras/start", post(web::admin::handle_start_all)) // 启动全部相机
        .route("/cameras/:name/start", post(web::admin::handle_start)) // 启动相机
        .route("/cameras/:name/stop", post(web::admin::handle_stop_camera)) // 停止相机
        .route("/cameras/:name/info", get(web::admin::camera_info)) // 视频流参数
        .route("/stop", post(web::admin::handle_stop)) // 停止全部相机
        .route("/records/:camera", get(web::records::list_records)) // 录像列表
        .route(
            "/records/:camera/:file_name",
            get(web::records::serve_record), // 下载录像
        )
        .with_state(state.clone());

    // 启动HTTP服务，Ctrl-C 时停止所有相机
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
            Engine::stop(&shutdown_state);
        })
        .await?;

    // 等待所有会话退出
    Engine::join(&state).await;
    info!("VTX Motion stopped");

    Ok(())
}
