use clap::Parser;
use resumable_upload_rust::{
    config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH},
    logging,
    server::{build_router, AppState},
    storage::split_file,
};
use std::path::PathBuf;
use tracing::info;

/// 分片上传服务端
#[derive(Debug, Parser)]
#[command(name = "resumable-upload-server", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 只把指定文件切分到分片目录后退出（不启动服务）
    #[arg(long, value_name = "FILE")]
    split: Option<PathBuf>,
}

/// 先单独读取日志配置，日志系统初始化之前不能输出日志
async fn load_log_config(path: &str) -> LogConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match toml::from_str::<AppConfig>(&content) {
            Ok(config) => config.log,
            Err(e) => {
                eprintln!("解析日志配置失败，使用默认配置: {}", e);
                LogConfig::default()
            }
        },
        Err(_) => LogConfig::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!(
        "{} v{} 启动中...",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = AppConfig::load_or_default(&cli.config).await;
    let app_state = AppState::new(config.clone()).await?;

    if let Some(source) = cli.split {
        let records = split_file(
            app_state.layout(),
            &source,
            config.storage.split_chunk_size(),
        )
        .await?;
        for record in &records {
            info!("  {} ({} bytes)", record.name, record.size);
        }
        return Ok(());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = build_router(app_state.clone());

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("健康检查: http://{}/health", addr);
    info!(
        "分片目录: {:?}, 文件目录: {:?}",
        config.storage.tmp_dir, config.storage.public_dir
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始关闭...");
        }
    }

    // 进行中的分片写入按中断处理，已写入的字节保留
    app_state.shutdown.cancel();
    info!("服务已退出");

    Ok(())
}
