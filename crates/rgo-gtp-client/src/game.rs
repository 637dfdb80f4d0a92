//! 対局ごとの進行管理（1対局1タスク）
//!
//! サーバからのイベントを受けて局面を更新し、手番が来たら着手計算を
//! 別タスクで1つだけ走らせる。着手計算タスクは
//!
//! 1. エンジンの確保（起動 → 拡張対応の問い合わせ → 局面の再現）
//! 2. 時間情報の送信
//! 3. `genmove`（助言役がいれば並行して）または `place_free_handicap`
//!
//! を順に行い、結果を [`MoveReport`] で返す。エンジンの失敗は対局の中で
//! 再試行・投了に解決し、他の対局には影響させない。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use rgo_gtp::moves::coords_of;
use rgo_gtp::{CodecError, Color, Move, WireMode, decode_compact};

use crate::clock::{ClockContext, ClockOffset, send_clock};
use crate::commentary::Analysis;
use crate::config::{GameConfig, IdleConfig, PersistConfig};
use crate::engine::{AnalysisSink, EngineRole, EngineSession, EngineSpawner};
use crate::error::{EngineError, PoolError};
use crate::pool::EnginePool;
use crate::protocol::{
    ChatBody, Clock, GameId, MatchState, MoveEvent, Phase, PlayerId, ServerCommand, Speed,
};
use crate::scheduler::{CorrespondenceScheduler, CorrespondenceSlot, MoveCounter, MoveGuard};

/// 対局タスクへの入力
#[derive(Debug)]
pub enum GameInput {
    Gamedata(Box<MatchState>),
    Move(MoveEvent),
    Phase(Phase),
    Clock(Clock),
    /// 通信対局の計算枠が回ってきた
    StartCorrespondence(CorrespondenceSlot),
    /// 相手の放置を確認する
    CheckIdle,
    Shutdown,
}

/// エンジンの調達先
#[derive(Clone)]
pub enum EngineSource {
    /// 対局ごとに起動する
    Dedicated(Arc<dyn EngineSpawner>),
    /// 主エンジンは常駐プールから借りる。助言役は `spawner` で都度起動する。
    Pooled {
        pool: EnginePool,
        spawner: Arc<dyn EngineSpawner>,
    },
}

impl EngineSource {
    pub fn spawner(&self) -> &Arc<dyn EngineSpawner> {
        match self {
            EngineSource::Dedicated(spawner) | EngineSource::Pooled { spawner, .. } => spawner,
        }
    }

    pub fn pool(&self) -> Option<&EnginePool> {
        match self {
            EngineSource::Pooled { pool, .. } => Some(pool),
            EngineSource::Dedicated(_) => None,
        }
    }
}

/// 全対局で共有する設定と資源
pub struct GameContext {
    pub bot_id: PlayerId,
    pub game: GameConfig,
    pub persist: PersistConfig,
    pub idle: IdleConfig,
    pub engines: EngineSource,
    pub scheduler: Arc<CorrespondenceScheduler>,
    pub moves_in_flight: Arc<MoveCounter>,
    pub offset: watch::Receiver<ClockOffset>,
    pub outbound: mpsc::UnboundedSender<ServerCommand>,
    /// プールのクラッシュループなど、ブリッジ全体を止めるべきエラー
    pub fatal: mpsc::UnboundedSender<PoolError>,
}

/// 手番の偶奇
///
/// 置碁（固定置石）や `initial_player` が白なら白から打つ。置石を自由に置く
/// 置碁では黒が置石の数だけ続けて打ち、その後は白から交互に打つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parity {
    first: Color,
    placement: usize,
}

impl Default for Parity {
    fn default() -> Self {
        Self {
            first: Color::Black,
            placement: 0,
        }
    }
}

impl Parity {
    pub fn of(state: &MatchState) -> Self {
        let placement = if state.free_handicap_placement && state.handicap > 1 {
            state.handicap as usize
        } else {
            0
        };
        let first = if state.initial_player == Some(Color::White) || (placement == 0 && state.handicap > 1) {
            Color::White
        } else {
            Color::Black
        };
        Self { first, placement }
    }

    /// 黒が続けて置く置石の数
    pub fn placement(&self) -> usize {
        self.placement
    }

    /// `index` 手目（0始まり）を打つ側
    pub fn mover(&self, index: usize) -> Color {
        if index < self.placement {
            return Color::Black;
        }
        let base = if self.placement > 0 { Color::White } else { self.first };
        if (index - self.placement) % 2 == 0 { base } else { !base }
    }

    /// 置石の後、相手の手が来る手数の偶奇（0/1）
    pub fn opponent_parity(&self, me: Color) -> usize {
        let base = if self.placement > 0 { Color::White } else { self.first };
        let shift = usize::from(base == me);
        (self.placement + shift) % 2
    }
}

/// 新しいエンジンに局面を再現させるコマンド列
pub fn replay_commands(state: &MatchState, history: &[Move], parity: Parity) -> Result<Vec<String>, CodecError> {
    let (w, h) = (state.width, state.height);
    let mut cmds = Vec::with_capacity(history.len() + 4);
    if w == h {
        cmds.push(format!("boardsize {w}"));
    } else {
        cmds.push(format!("rectangular_boardsize {w} {h}"));
    }
    cmds.push("clear_board".to_string());
    cmds.push(format!("komi {}", state.komi));
    for (color, stones) in [
        (Color::Black, &state.initial_state.black),
        (Color::White, &state.initial_state.white),
    ] {
        for stone in decode_compact(stones, w, h)? {
            if stone.vertex().is_some() {
                cmds.push(format!("play {color} {}", stone.to_engine(w, h)?));
            }
        }
    }

    let run = history.len().min(parity.placement());
    let placed = &history[..run];
    let mut start = 0;
    if run >= 2 && placed.iter().all(|m| m.vertex().is_some()) {
        let vertices = placed
            .iter()
            .map(|m| m.to_engine(w, h))
            .collect::<Result<Vec<_>, _>>()?;
        cmds.push(format!("set_free_handicap {}", vertices.join(" ")));
        start = run;
    }
    for (i, mv) in history.iter().enumerate().skip(start) {
        cmds.push(format!("play {} {}", parity.mover(i), mv.to_engine(w, h)?));
    }
    Ok(cmds)
}

/// `place_free_handicap` の応答を検査する。
pub fn parse_handicap(payload: &str, expected: usize, width: usize, height: usize) -> Result<Vec<Move>, String> {
    let stones = payload
        .split_whitespace()
        .map(|t| Move::from_engine(t, width, height))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    if stones.len() != expected {
        return Err(format!("expected {expected} stones, got {}", stones.len()));
    }
    if let Some(bad) = stones.iter().find(|m| m.vertex().is_none()) {
        return Err(format!("`{}` is not a stone", bad.text));
    }
    Ok(stones)
}

#[derive(Debug)]
enum ResignReason {
    Engine,
    Advisor,
    InvalidHandicap(String),
}

#[derive(Debug)]
enum MoveResult {
    Play(Move),
    Handicap(Vec<Move>),
    Resign(ResignReason),
    /// 主エンジンのコマンドが失敗した
    EngineFailed(EngineError),
    /// 起動・局面の再現ができなかった
    StartupFailed(PoolError),
}

/// 着手計算タスクの結果
struct MoveReport {
    primary: Option<EngineSession>,
    advisor: Option<EngineSession>,
    result: MoveResult,
    advisor_error: Option<EngineError>,
    /// 主エンジンの盤面に入っている手数
    engine_moves: usize,
}

/// 着手計算中に開いたセッション。中断時にまとめて後始末する。
type Engaged = Arc<Mutex<Vec<(EngineRole, EngineSession)>>>;

fn engage(engaged: &Engaged, role: EngineRole, session: &EngineSession) {
    engaged
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push((role, session.clone()));
}

struct MoveJob {
    game_id: GameId,
    engines: EngineSource,
    primary: Option<EngineSession>,
    use_advisor: bool,
    state: MatchState,
    history: Vec<Move>,
    color: Color,
    parity: Parity,
    /// `Some(n)`: 置石 n 個をまとめて求める
    handicap: Option<usize>,
    offset: ClockOffset,
    game: GameConfig,
    analysis: Option<AnalysisSink>,
    engaged: Engaged,
}

struct Prepared {
    session: EngineSession,
    spawned: bool,
    deferred: Vec<Ack>,
}

type Ack = oneshot::Receiver<Result<String, EngineError>>;

async fn recv(label: &str, ack: Ack) -> Result<String, EngineError> {
    ack.await.unwrap_or_else(|_| {
        Err(EngineError::Dead {
            label: label.to_string(),
        })
    })
}

async fn settle(label: &str, acks: Vec<Ack>) -> Result<(), EngineError> {
    for ack in acks {
        recv(label, ack).await?;
    }
    Ok(())
}

impl MoveJob {
    fn tag(&self) -> String {
        format!("[game {}]", self.game_id)
    }

    fn clock_context(&self, spawned: bool) -> ClockContext {
        let buffer = if spawned { self.game.startup_buffer_ms as f64 } else { 0.0 };
        ClockContext::now(self.offset, buffer)
    }

    /// 局面を再現する。テキスト形式では応答を待ち、JSON 形式では受け口を返す。
    async fn replay(&self, session: &EngineSession) -> Result<Vec<Ack>, EngineError> {
        let acks: Vec<Ack> = replay_commands(&self.state, &self.history, self.parity)?
            .iter()
            .map(|cmd| session.submit(cmd, false))
            .collect();
        if session.wire() == WireMode::Json {
            return Ok(acks);
        }
        settle(session.label(), acks).await?;
        if self.game.showboard {
            let board = session.command("showboard").await?;
            debug!("{} {} board after replay:\n{}", self.tag(), session.label(), board);
        }
        Ok(Vec::new())
    }

    async fn open_primary(&mut self) -> Result<Prepared, PoolError> {
        if let Some(pool) = self.engines.pool() {
            let session = pool.acquire().await?;
            engage(&self.engaged, EngineRole::Primary, &session);
            self.primary = Some(session.clone());
            // 借りたエンジンの盤面は前の対局のものなので毎回作り直す
            let deferred = self.replay(&session).await?;
            return Ok(Prepared {
                session,
                spawned: false,
                deferred,
            });
        }
        if let Some(session) = self.primary.clone().filter(|s| !s.is_dead()) {
            engage(&self.engaged, EngineRole::Primary, &session);
            return Ok(Prepared {
                session,
                spawned: false,
                deferred: Vec::new(),
            });
        }
        let session = self
            .engines
            .spawner()
            .spawn(EngineRole::Primary, self.analysis.clone())?;
        engage(&self.engaged, EngineRole::Primary, &session);
        self.primary = Some(session.clone());
        session.probe_capabilities().await?;
        let deferred = self.replay(&session).await?;
        Ok(Prepared {
            session,
            spawned: true,
            deferred,
        })
    }

    /// 助言役に1手考えさせ、投了を勧めるかを返す。
    async fn advise(&self, genmove: &str) -> (Option<EngineSession>, Result<bool, EngineError>) {
        let session = match self.engines.spawner().spawn(EngineRole::Advisor, None) {
            Ok(session) => session,
            Err(e) => return (None, Err(e)),
        };
        engage(&self.engaged, EngineRole::Advisor, &session);
        let verdict = async {
            session.probe_capabilities().await?;
            let deferred = self.replay(&session).await?;
            if let Some(clock) = &self.state.clock {
                send_clock(&session, &self.state.time_control, clock, &self.clock_context(true));
            }
            let ack = session.submit(genmove, true);
            settle(session.label(), deferred).await?;
            let payload = recv(session.label(), ack).await?;
            let mv = Move::from_engine(&payload, self.state.width, self.state.height)?;
            Ok::<bool, EngineError>(mv.resign)
        }
        .await;
        (Some(session), verdict)
    }

    fn report(&mut self, result: MoveResult) -> MoveReport {
        MoveReport {
            primary: self.primary.take(),
            advisor: None,
            result,
            advisor_error: None,
            engine_moves: 0,
        }
    }
}

/// 応答が最低着手時間より早ければ、送信をその時刻まで遅らせる。
async fn hold_until(started: tokio::time::Instant, game: &GameConfig) {
    tokio::time::sleep_until(started + game.min_move_time()).await;
}

async fn compute_move(mut job: MoveJob) -> MoveReport {
    let started = tokio::time::Instant::now();
    let prepared = match job.open_primary().await {
        Ok(prepared) => prepared,
        Err(e) => return job.report(MoveResult::StartupFailed(e)),
    };
    let session = prepared.session;
    let label = session.label().to_string();
    let (w, h) = (job.state.width, job.state.height);

    if let Some(clock) = &job.state.clock {
        send_clock(&session, &job.state.time_control, clock, &job.clock_context(prepared.spawned));
    }

    if let Some(n) = job.handicap {
        let command = format!("place_free_handicap {n}");
        let ack = session.submit(&command, true);
        let answer = async {
            settle(&label, prepared.deferred).await?;
            recv(&label, ack).await
        }
        .await;
        let result = match answer {
            Err(e) => MoveResult::EngineFailed(e),
            Ok(payload) => match parse_handicap(&payload, n, w, h) {
                Ok(stones) => {
                    hold_until(started, &job.game).await;
                    MoveResult::Handicap(stones)
                }
                Err(message) => MoveResult::Resign(ResignReason::InvalidHandicap(message)),
            },
        };
        let mut report = job.report(result);
        report.engine_moves = job.history.len() + n;
        return report;
    }

    let genmove = format!("genmove {}", job.color);
    let primary = async {
        let ack = session.submit(&genmove, true);
        settle(&label, prepared.deferred).await?;
        let payload = recv(&label, ack).await?;
        Move::from_engine(&payload, w, h).map_err(|e| EngineError::InvalidResponse {
            label: label.clone(),
            command: genmove.clone(),
            message: e.to_string(),
        })
    };
    let advisor = async {
        if job.use_advisor {
            Some(job.advise(&genmove).await)
        } else {
            None
        }
    };
    let (primary, advisor) = tokio::join!(primary, advisor);

    let (advisor, advisor_error, advisor_resigns) = match advisor {
        None => (None, None, false),
        Some((session, Ok(resigns))) => (session, None, resigns),
        Some((session, Err(e))) => (session, Some(e), false),
    };
    let result = match primary {
        _ if advisor_resigns => MoveResult::Resign(ResignReason::Advisor),
        Err(e) => MoveResult::EngineFailed(e),
        Ok(mv) if mv.resign => MoveResult::Resign(ResignReason::Engine),
        Ok(mv) => {
            hold_until(started, &job.game).await;
            MoveResult::Play(mv)
        }
    };
    let mut report = job.report(result);
    report.advisor = advisor;
    report.advisor_error = advisor_error;
    report.engine_moves = job.history.len() + 1;
    report
}

struct InFlight {
    handle: JoinHandle<MoveReport>,
    engaged: Engaged,
    _slot: Option<CorrespondenceSlot>,
    _guard: MoveGuard,
}

#[derive(Debug, Default, Clone, Copy)]
struct Failures {
    primary: u32,
    advisor: u32,
}

/// 1対局の進行を担うタスク本体
pub struct GameActor {
    game_id: GameId,
    ctx: Arc<GameContext>,
    state: Option<MatchState>,
    history: Vec<Move>,
    color: Option<Color>,
    parity: Parity,
    primary: Option<EngineSession>,
    /// 主エンジンの盤面に入っている手数
    engine_moves: usize,
    failures: Failures,
    advisor_disabled: bool,
    handicap_queue: VecDeque<Move>,
    handicap_reminded: bool,
    /// 着手を送った時点の手数。サーバから返ってくるまで同じ手番では考えない。
    submitted: Option<usize>,
    in_flight: Option<InFlight>,
    slot: Option<CorrespondenceSlot>,
    last_analysis: Option<usize>,
    analysis_tx: AnalysisSink,
    analysis_rx: mpsc::UnboundedReceiver<Analysis>,
    resigned: bool,
    resume_requested: bool,
    done: bool,
}

enum Wake {
    Input(Option<GameInput>),
    Analysis(Analysis),
    Report(Result<MoveReport, tokio::task::JoinError>),
}

async fn wait_in_flight(in_flight: &mut Option<InFlight>) -> Result<MoveReport, tokio::task::JoinError> {
    match in_flight {
        Some(flight) => (&mut flight.handle).await,
        None => std::future::pending().await,
    }
}

/// 対局タスクを起動し、入力の送り口を返す。
pub fn spawn_game(game_id: GameId, ctx: Arc<GameContext>) -> (mpsc::UnboundedSender<GameInput>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = GameActor::new(game_id, ctx);
    (tx, tokio::spawn(actor.run(rx)))
}

impl GameActor {
    pub fn new(game_id: GameId, ctx: Arc<GameContext>) -> Self {
        let (analysis_tx, analysis_rx) = mpsc::unbounded_channel();
        Self {
            game_id,
            ctx,
            state: None,
            history: Vec::new(),
            color: None,
            parity: Parity::default(),
            primary: None,
            engine_moves: 0,
            failures: Failures::default(),
            advisor_disabled: false,
            handicap_queue: VecDeque::new(),
            handicap_reminded: false,
            submitted: None,
            in_flight: None,
            slot: None,
            last_analysis: None,
            analysis_tx,
            analysis_rx,
            resigned: false,
            resume_requested: false,
            done: false,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<GameInput>) {
        while !self.done {
            let wake = tokio::select! {
                input = inbox.recv() => Wake::Input(input),
                Some(found) = self.analysis_rx.recv() => Wake::Analysis(found),
                report = wait_in_flight(&mut self.in_flight) => Wake::Report(report),
            };
            match wake {
                Wake::Input(Some(input)) => self.on_input(input),
                Wake::Input(None) => self.close(),
                Wake::Analysis(found) => self.on_analysis(found),
                Wake::Report(Ok(report)) => self.on_report(report),
                Wake::Report(Err(e)) => {
                    warn!("{} move task failed: {}", self.tag(), e);
                    self.abandon_in_flight();
                    self.teardown_primary(true);
                }
            }
        }
        debug!("{} stopped", self.tag());
    }

    fn tag(&self) -> String {
        format!("[game {}]", self.game_id)
    }

    fn send(&self, command: ServerCommand) {
        if self.ctx.outbound.send(command).is_err() {
            debug!("{} outbound channel closed", self.tag());
        }
    }

    fn chat(&self, text: impl Into<String>) {
        self.send(ServerCommand::Chat {
            game_id: self.game_id,
            channel: crate::protocol::ChatChannel::Main,
            move_number: self.history.len(),
            body: ChatBody::Text(text.into()),
        });
    }

    fn speed(&self) -> Speed {
        self.state
            .as_ref()
            .map_or(Speed::Live, |s| s.time_control.speed())
    }

    fn dims(&self) -> (usize, usize) {
        self.state.as_ref().map_or((19, 19), |s| (s.width, s.height))
    }

    /// 取りこぼしを疑ったら接続し直し、局面を送り直してもらう。
    fn resync(&self) {
        info!("{} resyncing", self.tag());
        self.send(ServerCommand::Disconnect { game_id: self.game_id });
        self.send(ServerCommand::Connect { game_id: self.game_id });
    }

    fn on_input(&mut self, input: GameInput) {
        match input {
            GameInput::Gamedata(state) => self.on_gamedata(*state),
            GameInput::Move(ev) => self.on_move(ev),
            GameInput::Phase(phase) => self.on_phase(phase),
            GameInput::Clock(clock) => self.on_clock(clock),
            GameInput::StartCorrespondence(slot) => {
                self.slot = Some(slot);
                self.try_move();
                // 使われなかった枠はここで返す
                self.slot = None;
            }
            GameInput::CheckIdle => self.check_idle(),
            GameInput::Shutdown => self.shutdown(),
        }
    }

    fn on_gamedata(&mut self, state: MatchState) {
        let Some(color) = state.color_of(self.ctx.bot_id) else {
            warn!("{} bot {} is not playing, leaving", self.tag(), self.ctx.bot_id);
            self.close();
            return;
        };
        let history = match state.moves.decode(state.width, state.height) {
            Ok(history) => history,
            Err(e) => {
                warn!("{} unreadable move history: {}", self.tag(), e);
                return;
            }
        };
        let changed = self.state.as_ref().is_some_and(|old| !old.same_position_as(&state));
        if changed {
            info!("{} game state changed, rebuilding engine state", self.tag());
            if self.primary.as_ref().is_some_and(EngineSession::is_failed) {
                self.failures.primary += 1;
            }
            self.abandon_in_flight();
            self.teardown_primary(true);
            self.handicap_queue.clear();
            self.submitted = None;
        }
        if history.len() < self.history.len() {
            self.submitted = None;
        }
        if self.state.is_none() {
            let parity = Parity::of(&state);
            info!(
                "{} joined as {} ({}x{}, {:?}, opponent parity {})",
                self.tag(),
                color,
                state.width,
                state.height,
                state.time_control.speed(),
                parity.opponent_parity(color)
            );
        }
        self.color = Some(color);
        self.parity = Parity::of(&state);
        self.history = history;
        let finished = state.phase == Phase::Finished;
        self.state = Some(state);
        if finished {
            self.finish();
            return;
        }
        self.sync_engine();
        self.check_pause();
        self.try_move();
    }

    fn on_move(&mut self, ev: MoveEvent) {
        let Some((w, h)) = self.state.as_ref().map(|s| (s.width, s.height)) else {
            warn!("{} move before game state", self.tag());
            self.resync();
            return;
        };
        let len = self.history.len();
        if ev.move_number <= len {
            debug!("{} move {} already applied", self.tag(), ev.move_number);
            return;
        }
        if ev.move_number > len + 1 {
            warn!(
                "{} move {} arrived with only {} moves known",
                self.tag(),
                ev.move_number,
                len
            );
            self.resync();
            return;
        }
        let mv = match coords_of(&ev.coords).and_then(|(x, y)| Move::from_coords(x, y, w, h)) {
            Ok(mv) => mv,
            Err(e) => {
                warn!("{} bad move payload {:?}: {}", self.tag(), ev.coords, e);
                self.resync();
                return;
            }
        };
        let recorded = self.state.as_mut().map(|s| s.moves.push(&mv));
        if let Some(Err(e)) = recorded {
            warn!("{} cannot record move: {}", self.tag(), e);
        }
        debug!("{} move {}: {} {}", self.tag(), ev.move_number, self.parity.mover(len), mv.text);
        self.history.push(mv);
        self.sync_engine();
        self.try_move();
    }

    fn on_phase(&mut self, phase: Phase) {
        if let Some(state) = self.state.as_mut() {
            state.phase = phase;
        }
        if phase == Phase::Finished {
            self.finish();
        } else {
            self.try_move();
        }
    }

    fn on_clock(&mut self, clock: Clock) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        state.clock = Some(clock);
        self.check_pause();
    }

    /// 通信対局で自分の手番中に相手が止めた一時停止は1度だけ解除を求める。
    fn check_pause(&mut self) {
        let (Some(state), Some(me)) = (self.state.as_ref(), self.color) else {
            return;
        };
        let Some(clock) = state.clock.as_ref() else {
            return;
        };
        if !clock.is_paused() {
            self.resume_requested = false;
            return;
        }
        let by_us = clock.pause.as_ref().and_then(|p| p.pausing_player_id) == Some(self.ctx.bot_id);
        if state.time_control.speed() == Speed::Correspondence
            && clock.color_to_move() == Some(me)
            && !by_us
            && !self.resume_requested
        {
            info!("{} paused on our turn, asking to resume", self.tag());
            self.resume_requested = true;
            self.send(ServerCommand::Resume { game_id: self.game_id });
        }
    }

    /// 相手の手番のまま放置されていれば切断する。
    fn check_idle(&mut self) {
        let (Some(state), Some(me)) = (self.state.as_ref(), self.color) else {
            return;
        };
        let Some(clock) = state.clock.as_ref() else {
            return;
        };
        if state.phase != Phase::Play || clock.color_to_move() == Some(me) {
            return;
        }
        let offset = *self.ctx.offset.borrow();
        let server_now = chrono::Utc::now().timestamp_millis() as f64 - offset.drift_ms;
        let idle_ms = server_now - clock.last_move;
        let limit = self.ctx.idle.timeout(state.time_control.speed());
        if idle_ms > limit.as_millis() as f64 {
            info!(
                "{} opponent idle for {:.0}s, disconnecting",
                self.tag(),
                idle_ms / 1000.0
            );
            self.close();
        }
    }

    fn on_analysis(&mut self, found: Analysis) {
        if !self.ctx.game.commentary || self.state.is_none() {
            return;
        }
        let from = self.history.len();
        if self.last_analysis == Some(from) {
            return;
        }
        let (w, h) = self.dims();
        if let Some(chat) = found.to_chat(from, w, h) {
            self.last_analysis = Some(from);
            self.send(ServerCommand::Chat {
                game_id: self.game_id,
                channel: self.ctx.game.analysis_channel,
                move_number: from,
                body: ChatBody::Analysis(chat),
            });
        }
    }

    /// 生きている主エンジンに、まだ知らない手を `play` で送る。
    fn sync_engine(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(session) = self.primary.as_ref() else {
            return;
        };
        let (w, h) = self.dims();
        while self.engine_moves < self.history.len() {
            let i = self.engine_moves;
            match self.history[i].to_engine(w, h) {
                Ok(vertex) => session.fire(&format!("play {} {}", self.parity.mover(i), vertex)),
                Err(e) => warn!("{} cannot forward move {}: {}", self.tag(), i + 1, e),
            }
            self.engine_moves += 1;
        }
    }

    /// 手番なら着手を求める。条件が揃わなければ何もしない。
    fn try_move(&mut self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let Some(me) = self.color else {
            return;
        };
        if self.done || self.resigned || self.in_flight.is_some() || state.phase != Phase::Play {
            return;
        }
        let index = self.history.len();
        match self.submitted {
            Some(n) if n == index => return,
            Some(_) => self.submitted = None,
            None => {}
        }
        let placing = index < self.parity.placement();
        if self.parity.mover(index) != me {
            if placing && me == Color::White && !self.handicap_reminded {
                self.handicap_reminded = true;
                self.chat("Please place your handicap stones. I will move once they are all placed.");
            }
            return;
        }
        if self.failures.primary >= self.ctx.game.max_failures {
            self.give_up();
            return;
        }
        if !placing {
            self.handicap_queue.clear();
        } else if let Some(stone) = self.handicap_queue.pop_front() {
            debug!("{} placing queued handicap stone {}", self.tag(), stone.text);
            self.submit_move(&stone);
            return;
        }
        if state.time_control.speed() == Speed::Correspondence && self.slot.is_none() {
            self.ctx.scheduler.register(self.game_id);
            return;
        }
        self.start_move();
    }

    fn start_move(&mut self) {
        let (Some(state), Some(color)) = (self.state.clone(), self.color) else {
            return;
        };
        let index = self.history.len();
        let handicap = (index < self.parity.placement()).then(|| self.parity.placement() - index);
        let use_advisor =
            handicap.is_none() && !self.advisor_disabled && self.ctx.engines.spawner().has_advisor();
        let analysis = self.ctx.game.commentary.then(|| self.analysis_tx.clone());
        let engaged = Engaged::default();
        let job = MoveJob {
            game_id: self.game_id,
            engines: self.ctx.engines.clone(),
            primary: self.primary.clone(),
            use_advisor,
            state,
            history: self.history.clone(),
            color,
            parity: self.parity,
            handicap,
            offset: *self.ctx.offset.borrow(),
            game: self.ctx.game.clone(),
            analysis,
            engaged: Arc::clone(&engaged),
        };
        match handicap {
            Some(n) => debug!("{} requesting {} handicap stones", self.tag(), n),
            None => debug!("{} requesting move {} as {}", self.tag(), index + 1, color),
        }
        self.ctx.scheduler.unregister(self.game_id);
        self.in_flight = Some(InFlight {
            handle: tokio::spawn(compute_move(job)),
            engaged,
            _slot: self.slot.take(),
            _guard: self.ctx.moves_in_flight.begin(),
        });
    }

    fn on_report(&mut self, report: MoveReport) {
        self.in_flight = None;
        if let Some(advisor) = report.advisor {
            // 助言役の盤面には自分の genmove が入っているので使い回さない
            advisor.kill(self.ctx.game.kill_grace());
        }
        if let Some(e) = report.advisor_error {
            self.on_advisor_failure(e);
        }
        self.primary = report.primary;
        match report.result {
            MoveResult::Play(mv) => {
                self.failures.primary = 0;
                self.engine_moves = report.engine_moves;
                info!("{} playing {}", self.tag(), mv.text);
                self.submit_move(&mv);
                self.after_move();
            }
            MoveResult::Handicap(stones) => {
                self.failures.primary = 0;
                self.engine_moves = report.engine_moves;
                info!("{} placing {} handicap stones", self.tag(), stones.len());
                self.handicap_queue = stones.into();
                if let Some(first) = self.handicap_queue.pop_front() {
                    self.submit_move(&first);
                }
                self.after_move();
            }
            MoveResult::Resign(ResignReason::InvalidHandicap(message)) => {
                warn!("{} invalid handicap placement: {}", self.tag(), message);
                self.chat("The engine returned an invalid handicap placement. Resigning.");
                self.resign();
            }
            MoveResult::Resign(reason) => {
                info!("{} resigning ({:?})", self.tag(), reason);
                self.resign();
            }
            MoveResult::EngineFailed(e) => {
                warn!("{} engine failure: {}", self.tag(), e);
                self.teardown_primary(true);
                self.failures.primary += 1;
                if self.failures.primary < self.ctx.game.max_failures {
                    self.chat("The engine failed to produce a move. Restarting it and trying again.");
                }
                self.try_move();
            }
            MoveResult::StartupFailed(e) => {
                warn!("{} engine startup failed: {}", self.tag(), e);
                if matches!(e, PoolError::CrashLoop { .. } | PoolError::Closed) {
                    let _ = self.ctx.fatal.send(e);
                }
                self.teardown_primary(true);
                self.failures.primary += 1;
                self.resync();
            }
        }
    }

    fn on_advisor_failure(&mut self, e: EngineError) {
        self.failures.advisor += 1;
        warn!(
            "{} advisor failure {}/{}: {}",
            self.tag(),
            self.failures.advisor,
            self.ctx.game.max_failures,
            e
        );
        if self.failures.advisor >= self.ctx.game.max_failures && !self.advisor_disabled {
            warn!("{} disabling the resign advisor for this game", self.tag());
            self.advisor_disabled = true;
        }
    }

    /// 着手後、設定に従い主エンジンを残すか終了させる。
    fn after_move(&mut self) {
        let keep = self.ctx.engines.pool().is_none()
            && self.ctx.persist.for_speed(self.speed())
            && self
                .primary
                .as_ref()
                .is_some_and(|s| s.wire() == WireMode::Text && !s.is_dead());
        if keep {
            self.sync_engine();
        } else {
            self.teardown_primary(false);
        }
    }

    /// 主エンジンを手放す。プールのものは返却（`discard` なら作り直し）する。
    fn teardown_primary(&mut self, discard: bool) {
        self.engine_moves = 0;
        let Some(session) = self.primary.take() else {
            return;
        };
        let grace = self.ctx.game.kill_grace();
        match self.ctx.engines.pool() {
            Some(pool) => {
                let pool = pool.clone();
                let fatal = self.ctx.fatal.clone();
                tokio::spawn(async move {
                    let returned = if discard {
                        pool.discard(session, grace).await
                    } else {
                        pool.release(session).await
                    };
                    if let Err(e) = returned {
                        let _ = fatal.send(e);
                    }
                });
            }
            None => session.kill(grace),
        }
    }

    /// 計算中の着手を打ち切り、開いていたセッションを後始末する。
    fn abandon_in_flight(&mut self) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        flight.handle.abort();
        let engaged: Vec<_> = flight
            .engaged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (role, session) in engaged {
            if role == EngineRole::Primary && self.primary.is_none() {
                self.primary = Some(session);
            } else if self.primary.as_ref().is_some_and(|p| p.label() == session.label()) {
                continue;
            } else {
                session.kill(self.ctx.game.kill_grace());
            }
        }
    }

    fn submit_move(&mut self, mv: &Move) {
        match mv.to_server() {
            Ok(encoded) => {
                self.submitted = Some(self.history.len());
                self.send(ServerCommand::Move {
                    game_id: self.game_id,
                    mv: encoded,
                });
            }
            Err(_) => self.resign(),
        }
    }

    fn give_up(&mut self) {
        warn!(
            "{} {} consecutive engine failures, resigning",
            self.tag(),
            self.failures.primary
        );
        self.chat(format!(
            "The engine failed {} times in a row. Resigning.",
            self.failures.primary
        ));
        self.resign();
    }

    fn resign(&mut self) {
        if self.resigned {
            return;
        }
        self.resigned = true;
        self.send(ServerCommand::Resign { game_id: self.game_id });
        self.ctx.scheduler.unregister(self.game_id);
        self.abandon_in_flight();
        self.teardown_primary(true);
    }

    fn finish(&mut self) {
        info!("{} finished", self.tag());
        self.close();
    }

    fn shutdown(&mut self) {
        let correspondence_in_play = self
            .state
            .as_ref()
            .is_some_and(|s| s.phase == Phase::Play && s.time_control.speed() == Speed::Correspondence);
        if correspondence_in_play && !self.resigned {
            self.send(ServerCommand::Pause { game_id: self.game_id });
        }
        self.close();
    }

    /// 後始末して切断し、タスクを終える。
    fn close(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.ctx.scheduler.unregister(self.game_id);
        self.abandon_in_flight();
        self.teardown_primary(true);
        self.send(ServerCommand::Disconnect { game_id: self.game_id });
    }
}
