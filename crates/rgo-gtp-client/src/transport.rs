//! サーバとの JSON-lines 接続
//!
//! 受信行は [`ServerEvent`] に、送信は [`ServerCommand`] を1行1件で書き出す。
//! 読めない行は警告を出して読み飛ばす。

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ServerCommand, ServerEvent};

/// 受信イベントの受け口と送信コマンドの送り口
pub struct JsonLinesTransport {
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    pub commands: mpsc::UnboundedSender<ServerCommand>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl JsonLinesTransport {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
        info!("connected to {addr}");
        let (read, write) = stream.into_split();
        Ok(Self::over(read, write))
    }

    /// 任意の入出力の上に作る。tokio ランタイム内で呼ぶこと。
    pub fn over<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        Self {
            events,
            commands,
            reader: tokio::spawn(read_events(reader, event_tx)),
            writer: tokio::spawn(write_commands(writer, command_rx)),
        }
    }
}

async fn read_events<R>(reader: R, tx: mpsc::UnboundedSender<ServerEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("server read failed: {e}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ServerEvent>(line) {
            Ok(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => warn!("ignoring unreadable server line ({e}): {line}"),
        }
    }
    debug!("server reader finished");
}

async fn write_commands<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<ServerCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        let mut line = match serde_json::to_string(&command) {
            Ok(line) => line,
            Err(e) => {
                warn!("cannot encode {command:?}: {e}");
                continue;
            }
        };
        line.push('\n');
        let written: std::io::Result<()> = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("server write failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("server writer finished");
}
