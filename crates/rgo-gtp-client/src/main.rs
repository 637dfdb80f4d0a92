//! `gtp_client`: 設定ファイルのエンジンをサーバにつないで対局させる

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use rgo_gtp_client::{Bridge, BridgeConfig, JsonLinesTransport};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ブリッジ設定（TOML）
    #[arg(short, long, default_value = "bridge.toml")]
    config: PathBuf,

    /// 接続先 `host:port`
    #[arg(short, long)]
    server: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BridgeConfig::load(&args.config)?;
    info!(
        "engine `{}`{}, bot id {}",
        config.engine.command,
        if config.advisor.is_some() { " with resign advisor" } else { "" },
        config.bot_id
    );

    let transport = JsonLinesTransport::connect(&args.server).await?;
    let bridge = Bridge::from_config(&config, transport.commands.clone())
        .await
        .context("failed to start engines")?;
    bridge
        .run(transport.events, shutdown_signal())
        .await
        .context("bridge stopped")?;

    // 切断などの最後の送信を書き出してから終わる
    drop(transport.commands);
    let _ = transport.writer.await;
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
