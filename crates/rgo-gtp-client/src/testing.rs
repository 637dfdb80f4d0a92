//! テスト用の台本エンジン
//!
//! 実プロセスの代わりに `tokio::io::duplex` の向こう側で台本どおりに応答する。
//! 受け取ったコマンドはすべて記録する。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rgo_gtp::WireMode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::commentary::Family;
use crate::engine::{AnalysisSink, EngineRole, EngineSession, EngineSpawner};
use crate::error::EngineError;

/// コマンド1行への応答。`None` ならエンジンはその場で落ちる。
pub type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// コマンド1行に対して応答より先に診断出力へ書く行
pub type Diagnostics = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// 台本どおりに応答するエンジンを duplex の上に作る
pub struct ScriptedSpawner {
    primary: Responder,
    advisor: Option<Responder>,
    stderr: Option<Diagnostics>,
    spawned: AtomicUsize,
    commands: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedSpawner {
    pub fn new(primary: Responder, advisor: Option<Responder>) -> Arc<Self> {
        Arc::new(Self {
            primary,
            advisor,
            stderr: None,
            spawned: AtomicUsize::new(0),
            commands: Arc::default(),
        })
    }

    /// 主エンジンが KataGo 形式の診断出力を書く。
    pub fn with_stderr(primary: Responder, stderr: Diagnostics) -> Arc<Self> {
        Arc::new(Self {
            primary,
            advisor: None,
            stderr: Some(stderr),
            spawned: AtomicUsize::new(0),
            commands: Arc::default(),
        })
    }

    /// `genmove` に `Q4` を返し、他はすべて空の成功
    pub fn katago_like() -> Arc<Self> {
        Self::new(Arc::new(katago_reply), None)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// (ラベル, コマンド) の受信記録
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub fn katago_reply(command: &str) -> Option<String> {
    let reply = if command == "list_commands" {
        "= genmove\nkgs-time_settings"
    } else if command.starts_with("genmove") {
        "= Q4"
    } else {
        "="
    };
    Some(reply.to_string())
}

impl EngineSpawner for ScriptedSpawner {
    fn spawn(&self, role: EngineRole, analysis: Option<AnalysisSink>) -> Result<EngineSession, EngineError> {
        let responder = match role {
            EngineRole::Primary => Arc::clone(&self.primary),
            EngineRole::Advisor => self.advisor.clone().ok_or_else(|| EngineError::Spawn {
                command: "scripted".into(),
                message: "no advisor".into(),
            })?,
        };
        let n = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let label = format!("{role}#{n}");
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, mut their_write) = tokio::io::split(theirs);
        let log = Arc::clone(&self.commands);
        let engine_label = label.clone();
        let (mut diagnostics, err_read) = match (&self.stderr, role) {
            (Some(script), EngineRole::Primary) => {
                let (ours, theirs) = tokio::io::duplex(64 * 1024);
                (Some((Arc::clone(script), theirs)), Some(ours))
            }
            _ => (None, None),
        };
        tokio::spawn(async move {
            let mut lines = BufReader::new(their_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((engine_label.clone(), line.clone()));
                if line == "quit" {
                    let _ = their_write.write_all(b"=\n\n").await;
                    break;
                }
                if let Some((script, err)) = diagnostics.as_mut() {
                    for text in script(&line) {
                        let _ = err.write_all(format!("{text}\n").as_bytes()).await;
                    }
                }
                let Some(reply) = responder(&line) else {
                    break;
                };
                if their_write.write_all(format!("{reply}\n\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        let session = EngineSession::from_io(label, WireMode::Text, our_write, our_read);
        if let Some(err_read) = err_read {
            session.attach_stderr(err_read, Family::Katago, analysis);
        }
        Ok(session)
    }

    fn has_advisor(&self) -> bool {
        self.advisor.is_some()
    }
}
