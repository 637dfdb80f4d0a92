//! サーバイベントの振り分けと全体の定期処理
//!
//! 対局ごとのタスク表を持ち、イベントを該当する [`GameActor`](crate::game::GameActor) へ
//! 渡す。加えて通信対局の順番待ちの払い出しと、放置対局の見回りを定期的に行う。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::ClockOffset;
use crate::config::BridgeConfig;
use crate::engine::{EngineSpawner, ProcessSpawner};
use crate::error::PoolError;
use crate::game::{EngineSource, GameContext, GameInput, spawn_game};
use crate::pool::EnginePool;
use crate::protocol::{GameId, ServerCommand, ServerEvent};
use crate::scheduler::{CorrespondenceScheduler, MoveCounter};

struct GameHandle {
    tx: mpsc::UnboundedSender<GameInput>,
    join: JoinHandle<()>,
}

/// 対局タスク群の親
pub struct Bridge {
    ctx: Arc<GameContext>,
    games: HashMap<GameId, GameHandle>,
    offset_tx: watch::Sender<ClockOffset>,
    fatal_rx: mpsc::UnboundedReceiver<PoolError>,
    rng: Xoshiro256PlusPlus,
    correspondence_interval: Duration,
    idle_interval: Duration,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        engines: EngineSource,
        outbound: mpsc::UnboundedSender<ServerCommand>,
    ) -> Self {
        let (offset_tx, offset_rx) = watch::channel(config.clock.offset());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let ctx = GameContext {
            bot_id: config.bot_id,
            game: config.game.clone(),
            persist: config.persist,
            idle: config.idle,
            engines,
            scheduler: CorrespondenceScheduler::new(),
            moves_in_flight: MoveCounter::new(),
            offset: offset_rx,
            outbound,
            fatal: fatal_tx,
        };
        Self {
            ctx: Arc::new(ctx),
            games: HashMap::new(),
            offset_tx,
            fatal_rx,
            rng: Xoshiro256PlusPlus::seed_from_u64(rand::random()),
            correspondence_interval: Duration::from_millis(config.scheduler.correspondence_interval_ms.max(1)),
            idle_interval: Duration::from_millis(config.idle.check_interval_ms.max(1)),
        }
    }

    /// 設定どおりに子プロセスの起動口（とプール）を用意して作る。
    pub async fn from_config(
        config: &BridgeConfig,
        outbound: mpsc::UnboundedSender<ServerCommand>,
    ) -> Result<Self, PoolError> {
        let spawner: Arc<dyn EngineSpawner> =
            Arc::new(ProcessSpawner::new(config.engine.clone(), config.advisor.clone()));
        let engines = if config.pool_enabled() {
            let pool = EnginePool::start(
                Arc::clone(&spawner),
                config.pool.size,
                Duration::from_millis(config.pool.min_respawn_ms),
            )
            .await?;
            EngineSource::Pooled { pool, spawner }
        } else {
            EngineSource::Dedicated(spawner)
        };
        Ok(Self::new(config, engines, outbound))
    }

    /// 乱択の種を固定する（テスト用）。
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        self
    }

    pub fn scheduler(&self) -> &Arc<CorrespondenceScheduler> {
        &self.ctx.scheduler
    }

    /// 全対局で計算中の着手の数
    pub fn moves_in_flight(&self) -> usize {
        self.ctx.moves_in_flight.get()
    }

    pub fn active_games(&self) -> usize {
        self.games.len()
    }

    /// イベントが尽きるか `shutdown` が完了するまで回す。
    ///
    /// プールのクラッシュループなど続行できないエラーでは `Err` で抜ける。
    pub async fn run<S>(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        shutdown: S,
    ) -> Result<(), PoolError>
    where
        S: Future<Output = ()>,
    {
        let mut correspondence = tokio::time::interval(self.correspondence_interval);
        correspondence.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle = tokio::time::interval(self.idle_interval);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => {
                        info!("server connection closed");
                        break Ok(());
                    }
                },
                _ = correspondence.tick() => self.dispatch_correspondence(),
                _ = idle.tick() => self.broadcast(|| GameInput::CheckIdle),
                Some(e) = self.fatal_rx.recv() => {
                    error!("fatal engine error: {e}");
                    break Err(e);
                }
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
            }
        };
        self.stop().await;
        outcome
    }

    fn route(&mut self, event: ServerEvent) {
        if let ServerEvent::ClockSync { drift_ms, latency_ms } = event {
            debug!("clock sync: drift {drift_ms}ms, latency {latency_ms}ms");
            self.offset_tx.send_replace(ClockOffset { drift_ms, latency_ms });
            return;
        }
        let Some(game_id) = event.game_id() else {
            return;
        };
        if self.games.get(&game_id).is_some_and(|h| h.tx.is_closed()) {
            self.games.remove(&game_id);
        }
        let input = match event {
            ServerEvent::Gamedata(state) => GameInput::Gamedata(Box::new(state)),
            ServerEvent::Move(ev) => GameInput::Move(ev),
            ServerEvent::Phase { phase, .. } => GameInput::Phase(phase),
            ServerEvent::Clock(clock) => GameInput::Clock(clock),
            ServerEvent::ClockSync { .. } => return,
        };
        if !self.games.contains_key(&game_id) {
            if !matches!(input, GameInput::Gamedata(_)) {
                // 対局状態を持っていないので送り直してもらう
                debug!("[game {game_id}] event for unknown game, requesting state");
                let _ = self.ctx.outbound.send(ServerCommand::Connect { game_id });
                return;
            }
            info!("[game {game_id}] starting");
            let (tx, join) = spawn_game(game_id, Arc::clone(&self.ctx));
            self.games.insert(game_id, GameHandle { tx, join });
        }
        if let Some(handle) = self.games.get(&game_id) {
            if handle.tx.send(input).is_err() {
                self.games.remove(&game_id);
            }
        }
    }

    fn dispatch_correspondence(&mut self) {
        let Some(slot) = self.ctx.scheduler.dispatch(&mut self.rng) else {
            return;
        };
        let game_id = slot.game_id();
        match self.games.get(&game_id) {
            Some(handle) => {
                debug!("[game {game_id}] correspondence turn");
                if handle.tx.send(GameInput::StartCorrespondence(slot)).is_err() {
                    warn!("[game {game_id}] gone before its correspondence turn");
                    self.games.remove(&game_id);
                }
            }
            None => slot.finish(),
        }
    }

    fn broadcast(&mut self, input: impl Fn() -> GameInput) {
        self.games.retain(|_, handle| handle.tx.send(input()).is_ok());
    }

    async fn stop(&mut self) {
        self.broadcast(|| GameInput::Shutdown);
        for (game_id, handle) in self.games.drain() {
            drop(handle.tx);
            if let Err(e) = handle.join.await {
                warn!("[game {game_id}] task ended abnormally: {e}");
            }
        }
        if let Some(pool) = self.ctx.engines.pool() {
            pool.shutdown(self.ctx.game.kill_grace());
        }
    }
}
