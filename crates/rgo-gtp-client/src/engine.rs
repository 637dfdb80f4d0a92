//! エンジンプロセスとの入出力ブリッジ
//!
//! GTP の応答には ID が無いため、送信したコマンドを保留キューに積み、
//! 完成した応答ブロックを先頭から順に対応付ける。キューへの追加と
//! 書き込みタスクへの送信は同じロックの中で行い、書き込み順と
//! キュー順が入れ替わらないようにしている。
//!
//! プロセスが終了した、または入出力が壊れたセッションは `dead` になり、
//! 保留中のコマンドはすべて [`EngineError::Dead`] で解決される。
//! `?` 応答やプロトコル違反は `failed` を立てるが、セッション自体は使い続けられる。

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use rgo_gtp::response::parse_list;
use rgo_gtp::{CommandFramer, Response, ResponseFramer, WireMode};

use crate::commentary::{self, Analysis, Family};
use crate::config::EngineConfig;
use crate::error::EngineError;

/// 対応コマンドの問い合わせ
pub const LIST_COMMANDS: &str = "list_commands";
/// 秒読み・カナダ式を直接指定できる拡張
pub const KGS_TIME_SETTINGS: &str = "kgs-time_settings";
/// 対応する持ち時間方式の問い合わせ（KataGo 拡張）
pub const KATA_LIST_TIME_SETTINGS: &str = "kata-list_time_settings";
/// 上限付きフィッシャー
pub const KATA_FISCHER_CAPPED: &str = "fischer-capped";

const READ_CHUNK: usize = 4096;
/// 終了要求が来ないままハンドルが捨てられたときの猶予
const DROP_KILL_GRACE: Duration = Duration::from_millis(300);

/// 解析要約の送り先
pub type AnalysisSink = mpsc::UnboundedSender<Analysis>;

type Reply = oneshot::Sender<Result<String, EngineError>>;

/// 起動後の問い合わせで分かったエンジンの拡張対応
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub kgs_time_settings: bool,
    pub kata_fischer: bool,
}

/// 対局内でのエンジンの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineRole {
    Primary,
    /// 投了するかどうかだけを判断する
    Advisor,
}

impl fmt::Display for EngineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineRole::Primary => "primary",
            EngineRole::Advisor => "advisor",
        })
    }
}

struct Pending {
    command: String,
    reply: Reply,
}

struct SessionState {
    responses: ResponseFramer,
    commands: CommandFramer,
    pending: VecDeque<Pending>,
    dead: bool,
    failed: bool,
    capabilities: Capabilities,
}

struct Shared {
    label: String,
    state: Mutex<SessionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// stdout のチャンクを処理し、完成した応答を保留中のコマンドへ順に返す。
    fn on_output(&self, chunk: &[u8]) {
        let mut st = self.lock();
        if st.dead {
            return;
        }
        let blocks = st.responses.feed(chunk);
        for block in blocks {
            let Some(pending) = st.pending.pop_front() else {
                warn!("{}: response with no pending command: {:?}", self.label, block);
                st.failed = true;
                continue;
            };
            let result = match block {
                Response::Success(payload) => {
                    debug!("{} -> = {}", self.label, payload);
                    Ok(payload)
                }
                Response::Failure(message) => {
                    debug!("{} -> ? {} (for `{}`)", self.label, message, pending.command);
                    st.failed = true;
                    Err(EngineError::CommandFailed {
                        label: self.label.clone(),
                        command: pending.command.clone(),
                        message,
                    })
                }
                Response::Malformed(output) => {
                    warn!("{}: protocol violation after `{}`: {}", self.label, pending.command, output);
                    st.failed = true;
                    Err(EngineError::Protocol {
                        label: self.label.clone(),
                        command: pending.command.clone(),
                        output,
                    })
                }
            };
            let _ = pending.reply.send(result);
        }
    }

    /// 出力の終端。保留中のコマンドはすべて失敗として解決する。
    fn mark_dead(&self) {
        let mut st = self.lock();
        st.dead = true;
        if !st.pending.is_empty() {
            st.failed = true;
        }
        for pending in st.pending.drain(..) {
            let _ = pending.reply.send(Err(EngineError::Dead {
                label: self.label.clone(),
            }));
        }
    }

    /// 書き込み失敗。最古の保留コマンドに原因を返し、残りは `Dead` で解決する。
    fn fail_io(&self, message: &str) {
        let mut st = self.lock();
        st.dead = true;
        st.failed = true;
        if let Some(oldest) = st.pending.pop_front() {
            let _ = oldest.reply.send(Err(EngineError::Io {
                label: self.label.clone(),
                message: message.to_string(),
            }));
        }
        for pending in st.pending.drain(..) {
            let _ = pending.reply.send(Err(EngineError::Dead {
                label: self.label.clone(),
            }));
        }
    }
}

enum WriteOp {
    Bytes(String),
    Close,
}

struct Inner {
    shared: Arc<Shared>,
    wire: WireMode,
    writer: mpsc::UnboundedSender<WriteOp>,
    supervisor: Mutex<Option<oneshot::Sender<Duration>>>,
    spawned_at: Instant,
}

/// 1つのエンジンプロセス（または任意の入出力ペア）とのセッション
///
/// 複製しても同じセッションを指す。最後のハンドルが捨てられると stdin が閉じ、
/// プロセスは猶予の後に強制終了される。
#[derive(Clone)]
pub struct EngineSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("label", &self.label())
            .field("dead", &self.is_dead())
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl EngineSession {
    /// 任意の入出力の上にセッションを作る。tokio ランタイム内で呼ぶこと。
    pub fn from_io<W, R>(label: impl Into<String>, wire: WireMode, stdin: W, stdout: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            label: label.into(),
            state: Mutex::new(SessionState {
                responses: ResponseFramer::new(wire),
                commands: CommandFramer::new(wire),
                pending: VecDeque::new(),
                dead: false,
                failed: false,
                capabilities: Capabilities::default(),
            }),
        });
        let (writer, write_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(Arc::clone(&shared), stdin, write_rx));
        tokio::spawn(read_loop(Arc::clone(&shared), stdout));
        Self {
            inner: Arc::new(Inner {
                shared,
                wire,
                writer,
                supervisor: Mutex::new(None),
                spawned_at: Instant::now(),
            }),
        }
    }

    /// エンジンプロセスを起動する。
    pub fn spawn(
        cfg: &EngineConfig,
        label: impl Into<String>,
        analysis: Option<AnalysisSink>,
    ) -> Result<Self, EngineError> {
        let label = label.into();
        let spawn_error = |message: String| EngineError::Spawn {
            command: cfg.command.clone(),
            message,
        };
        let mut child = Command::new(&cfg.command)
            .args(&cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;
        let stdin = child.stdin.take().ok_or_else(|| spawn_error("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_error("no stdout".into()))?;
        let stderr = child.stderr.take();
        info!("{label}: spawned `{}` (pid {:?})", cfg.command, child.id());

        let session = Self::from_io(label.clone(), cfg.wire, stdin, stdout);
        if let Some(stderr) = stderr {
            session.attach_stderr(stderr, cfg.family, analysis);
        }
        let (kill_tx, kill_rx) = oneshot::channel();
        *session.supervisor_slot() = Some(kill_tx);
        tokio::spawn(supervise(label, child, kill_rx));
        Ok(session)
    }

    /// 診断出力を読み、行を debug ログに流し、解析行を `analysis` へ送る。
    pub fn attach_stderr<E>(&self, stderr: E, family: Family, analysis: Option<AnalysisSink>)
    where
        E: AsyncRead + Unpin + Send + 'static,
    {
        let label = self.label().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("{label} stderr: {line}");
                if let Some(tx) = &analysis {
                    if let Some(found) = commentary::parse_line(family, &line) {
                        let _ = tx.send(found);
                    }
                }
            }
        });
    }

    fn supervisor_slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<Duration>>> {
        self.inner.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn label(&self) -> &str {
        &self.inner.shared.label
    }

    pub fn wire(&self) -> WireMode {
        self.inner.wire
    }

    pub fn is_dead(&self) -> bool {
        self.inner.shared.lock().dead
    }

    pub fn is_failed(&self) -> bool {
        self.inner.shared.lock().failed
    }

    /// 応答待ちのコマンド数
    pub fn pending(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.shared.lock().capabilities
    }

    /// 起動からの経過時間
    pub fn age(&self) -> Duration {
        self.inner.spawned_at.elapsed()
    }

    /// コマンドを送り、応答の受け口を返す。
    ///
    /// JSON 形式では `is_final` のコマンドでコマンド列を閉じ、stdin も閉じる。
    /// 失敗は受け口に `Err` として届き、この関数自体は失敗しない。
    pub fn submit(&self, command: &str, is_final: bool) -> oneshot::Receiver<Result<String, EngineError>> {
        let (tx, rx) = oneshot::channel();
        let shared = &self.inner.shared;
        let mut st = shared.lock();
        if st.dead {
            let _ = tx.send(Err(EngineError::Dead {
                label: shared.label.clone(),
            }));
            return rx;
        }
        let framed = match st.commands.frame(command, is_final) {
            Ok(framed) => framed,
            Err(e) => {
                st.failed = true;
                let _ = tx.send(Err(e.into()));
                return rx;
            }
        };
        debug!("{} <- {}", shared.label, command);
        st.pending.push_back(Pending {
            command: command.to_string(),
            reply: tx,
        });
        let mut sent = self.inner.writer.send(WriteOp::Bytes(framed.bytes)).is_ok();
        if sent && framed.close_stdin {
            sent = self.inner.writer.send(WriteOp::Close).is_ok();
        }
        drop(st);
        if !sent {
            shared.fail_io("writer task has stopped");
        }
        rx
    }

    /// コマンドを送り、応答を待つ。
    pub async fn command(&self, command: &str) -> Result<String, EngineError> {
        self.request(command, false).await
    }

    pub async fn request(&self, command: &str, is_final: bool) -> Result<String, EngineError> {
        let rx = self.submit(command, is_final);
        rx.await.unwrap_or_else(|_| {
            Err(EngineError::Dead {
                label: self.label().to_string(),
            })
        })
    }

    /// 応答を待たずに送る。失敗しても `failed` が立つだけ。
    pub fn fire(&self, command: &str) {
        drop(self.submit(command, false));
    }

    /// `list_commands` で拡張対応を調べる。JSON 形式では問い合わせない。
    pub async fn probe_capabilities(&self) -> Result<Capabilities, EngineError> {
        if self.wire() == WireMode::Json {
            return Ok(Capabilities::default());
        }
        let listed = parse_list(&self.command(LIST_COMMANDS).await?);
        let mut caps = Capabilities {
            kgs_time_settings: listed.iter().any(|c| c == KGS_TIME_SETTINGS),
            kata_fischer: false,
        };
        if listed.iter().any(|c| c == KATA_LIST_TIME_SETTINGS) {
            let systems = self.command(KATA_LIST_TIME_SETTINGS).await?;
            caps.kata_fischer = systems.split_whitespace().any(|s| s == KATA_FISCHER_CAPPED);
        }
        debug!("{}: capabilities {:?}", self.label(), caps);
        self.inner.shared.lock().capabilities = caps;
        Ok(caps)
    }

    /// `quit` を送って終了させる。
    ///
    /// セッションは直ちに `dead` になり、保留中のコマンドは失敗する。
    /// プロセスが `grace` 内に終了しなければ強制終了する。
    pub fn kill(&self, grace: Duration) {
        let shared = &self.inner.shared;
        {
            let mut st = shared.lock();
            if !st.dead {
                if let Ok(framed) = st.commands.frame("quit", true) {
                    debug!("{} <- quit", shared.label);
                    let _ = self.inner.writer.send(WriteOp::Bytes(framed.bytes));
                }
                let _ = self.inner.writer.send(WriteOp::Close);
            }
        }
        shared.mark_dead();
        if let Some(kill_tx) = self.supervisor_slot().take() {
            let _ = kill_tx.send(grace);
        }
    }
}

async fn write_loop<W>(shared: Arc<Shared>, mut stdin: W, mut rx: mpsc::UnboundedReceiver<WriteOp>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Bytes(bytes) => {
                let written: std::io::Result<()> = async {
                    stdin.write_all(bytes.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!("{}: write failed: {}", shared.label, e);
                    shared.fail_io(&e.to_string());
                    break;
                }
            }
            WriteOp::Close => {
                let _ = stdin.shutdown().await;
                break;
            }
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut stdout: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => shared.on_output(&buf[..n]),
            Err(e) => {
                warn!("{}: read failed: {}", shared.label, e);
                break;
            }
        }
    }
    debug!("{}: output closed", shared.label);
    shared.mark_dead();
}

/// プロセスの終了を見届ける。終了要求が来たら猶予の後に強制終了する。
async fn supervise(label: String, mut child: Child, kill_rx: oneshot::Receiver<Duration>) {
    enum Wake {
        Exited(std::io::Result<std::process::ExitStatus>),
        Kill(Duration),
    }
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        grace = kill_rx => Wake::Kill(grace.unwrap_or(DROP_KILL_GRACE)),
    };
    match wake {
        Wake::Exited(status) => info!("{label}: exited ({status:?})"),
        Wake::Kill(grace) => match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => debug!("{label}: quit ({status:?})"),
            Err(_) => {
                warn!("{label}: still running {grace:?} after quit, killing");
                if let Err(e) = child.start_kill() {
                    warn!("{label}: kill failed: {e}");
                }
                let _ = child.wait().await;
            }
        },
    }
}

/// 対局ごとにエンジンセッションを作る
///
/// 実プロセス以外（テスト用の台本エンジンなど）に差し替えられるよう trait にしている。
pub trait EngineSpawner: Send + Sync {
    fn spawn(&self, role: EngineRole, analysis: Option<AnalysisSink>) -> Result<EngineSession, EngineError>;

    /// 助言役エンジンが設定されているか
    fn has_advisor(&self) -> bool;
}

/// 設定どおりに子プロセスを起動する
pub struct ProcessSpawner {
    primary: EngineConfig,
    advisor: Option<EngineConfig>,
    serial: AtomicU64,
}

impl ProcessSpawner {
    pub fn new(primary: EngineConfig, advisor: Option<EngineConfig>) -> Self {
        Self {
            primary,
            advisor,
            serial: AtomicU64::new(0),
        }
    }
}

impl EngineSpawner for ProcessSpawner {
    fn spawn(&self, role: EngineRole, analysis: Option<AnalysisSink>) -> Result<EngineSession, EngineError> {
        let cfg = match role {
            EngineRole::Primary => &self.primary,
            EngineRole::Advisor => self.advisor.as_ref().ok_or_else(|| EngineError::Spawn {
                command: String::new(),
                message: "no advisor engine configured".into(),
            })?,
        };
        let n = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        EngineSession::spawn(cfg, format!("{role}#{n}"), analysis)
    }

    fn has_advisor(&self) -> bool {
        self.advisor.is_some()
    }
}
