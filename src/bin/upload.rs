// 命令行上传客户端
//
// upload <FILE> [--server URL] [--chunk-size-mb N]
//
// Ctrl+C 暂停（取消所有传输中的分片），再次运行同一命令即从已落盘位置继续

use anyhow::Context;
use clap::Parser;
use resumable_upload_rust::{
    config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH},
    logging, HttpTransport, UploadError, UploadEvent, UploadManager, UploadOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "upload", version, about = "可续传的分片上传客户端")]
struct Cli {
    /// 要上传的文件
    #[arg(required = true)]
    file: PathBuf,

    /// 服务地址
    #[arg(short, long, env = "UPLOAD_SERVER_URL")]
    server: Option<String>,

    /// 分片大小 (MB)
    #[arg(long)]
    chunk_size_mb: Option<u64>,

    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 客户端只输出到控制台
    let _log_guard = logging::init_logging(&LogConfig {
        enabled: false,
        level: "warn".to_string(),
        ..LogConfig::default()
    });

    let mut config = AppConfig::load_from_file(&cli.config)
        .await
        .unwrap_or_default();
    if let Some(server) = cli.server {
        config.upload.server_url = server;
    }
    if let Some(chunk_size_mb) = cli.chunk_size_mb {
        config.upload.chunk_size_mb = chunk_size_mb;
    }
    config.validate()?;

    let transport = HttpTransport::new(&config.upload.server_url)?;
    let manager = UploadManager::new(
        Arc::new(transport),
        config.upload.chunk_size(),
        config.upload.policy(),
    )?;

    let task_id = manager
        .create_task(cli.file.clone())
        .await
        .with_context(|| format!("无法上传 {:?}", cli.file))?;

    let printer = tokio::spawn(print_events(manager.subscribe()));

    let mut handle = manager.start_task(&task_id)?;
    let result = tokio::select! {
        joined = &mut handle => joined?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("正在暂停...");
            manager.pause_task(&task_id).await?;
            handle.await?
        }
    };

    printer.abort();

    match result {
        Ok(UploadOutcome::InstantUpload) => {
            println!("秒传成功");
            Ok(())
        }
        Ok(UploadOutcome::Uploaded(merged)) => {
            println!("上传成功: {} ({} bytes)", merged.name, merged.size);
            info!("上传完成: {}", merged.name);
            Ok(())
        }
        Err(UploadError::FailedOrPaused) => {
            println!("上传失败或暂停中，重新运行同一命令即可继续");
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<UploadEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(UploadEvent::HashProgress { percent, .. }) => {
                println!("计算指纹: {:>6.2}%", percent);
            }
            Ok(UploadEvent::PartProgress {
                part_percents,
                progress,
                ..
            }) => {
                let parts: Vec<String> =
                    part_percents.iter().map(|p| format!("{:.2}", p)).collect();
                println!("上传进度: {:>6.2}%  [{}]", progress, parts.join(" "));
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}
