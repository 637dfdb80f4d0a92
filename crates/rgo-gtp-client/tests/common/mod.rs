#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rgo_gtp_client::config::BridgeConfig;
use rgo_gtp_client::game::EngineSource;
use rgo_gtp_client::testing::ScriptedSpawner;
use rgo_gtp_client::{Bridge, PoolError, ServerCommand, ServerEvent};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const BLACK: u64 = 10;
pub const WHITE: u64 = 20;
pub const GAME: u64 = 42;

pub struct Harness {
    pub events: mpsc::UnboundedSender<ServerEvent>,
    pub outbound: mpsc::UnboundedReceiver<ServerCommand>,
    pub shutdown: Option<oneshot::Sender<()>>,
    pub bridge: JoinHandle<Result<(), PoolError>>,
}

impl Harness {
    pub fn start(config: BridgeConfig, spawner: Arc<ScriptedSpawner>) -> Self {
        Self::start_with(config, EngineSource::Dedicated(spawner))
    }

    pub fn start_with(config: BridgeConfig, engines: EngineSource) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let bridge = Bridge::new(&config, engines, outbound_tx).with_seed(1);
        let bridge = tokio::spawn(bridge.run(events_rx, async {
            let _ = shutdown_rx.await;
        }));
        Self {
            events,
            outbound,
            shutdown: Some(shutdown_tx),
            bridge,
        }
    }

    pub fn send(&self, event: ServerEvent) {
        self.events.send(event).unwrap();
    }

    /// 次に送られたコマンド
    pub async fn next(&mut self) -> ServerCommand {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for a server command")
            .expect("outbound channel closed")
    }

    /// 条件に合うコマンドが来るまで読み飛ばす。読み飛ばした分も返す。
    pub async fn until(&mut self, pred: impl Fn(&ServerCommand) -> bool) -> Vec<ServerCommand> {
        let mut seen = Vec::new();
        loop {
            let cmd = self.next().await;
            let done = pred(&cmd);
            seen.push(cmd);
            if done {
                return seen;
            }
        }
    }

    pub async fn stop(mut self) -> Vec<ServerCommand> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.bridge.await.unwrap().unwrap();
        let mut rest = Vec::new();
        while let Ok(cmd) = self.outbound.try_recv() {
            rest.push(cmd);
        }
        rest
    }
}

pub fn config(bot_id: u64) -> BridgeConfig {
    let mut cfg = BridgeConfig {
        bot_id,
        ..BridgeConfig::default()
    };
    cfg.engine.command = "scripted".into();
    cfg.game.startup_buffer_ms = 0;
    cfg.game.kill_grace_ms = 10;
    cfg.scheduler.correspondence_interval_ms = 10;
    cfg
}

pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

pub fn canadian() -> Value {
    json!({
        "system": "canadian",
        "main_time": 60,
        "period_time": 30,
        "stones_per_period": 5,
        "speed": "live"
    })
}

pub fn side(thinking_time: f64) -> Value {
    json!({"thinking_time": thinking_time, "moves_left": 0, "block_time": 30})
}

pub fn clock(game_id: u64, to_move: u64, last_move: f64) -> Value {
    json!({
        "game_id": game_id,
        "current_player": to_move,
        "black_player_id": BLACK,
        "white_player_id": WHITE,
        "last_move": last_move,
        "black_time": side(60.0),
        "white_time": side(60.0)
    })
}

/// 19路の対局状態。`extra` で任意の項目を上書きする。
pub fn gamedata(game_id: u64, moves: Value, to_move: u64, extra: Value) -> ServerEvent {
    let mut v = json!({
        "event": "gamedata",
        "game_id": game_id,
        "width": 19,
        "height": 19,
        "komi": 6.5,
        "handicap": 0,
        "moves": moves,
        "black_player_id": BLACK,
        "white_player_id": WHITE,
        "phase": "play",
        "time_control": canadian(),
        "clock": clock(game_id, to_move, now_ms())
    });
    if let (Some(obj), Some(extra)) = (v.as_object_mut(), extra.as_object()) {
        for (k, val) in extra {
            obj.insert(k.clone(), val.clone());
        }
    }
    serde_json::from_value(v).unwrap()
}

pub fn move_event(game_id: u64, move_number: usize, x: i64, y: i64) -> ServerEvent {
    serde_json::from_value(json!({
        "event": "move",
        "game_id": game_id,
        "move_number": move_number,
        "move": [x, y, 1000]
    }))
    .unwrap()
}

pub fn is_move(cmd: &ServerCommand) -> bool {
    matches!(cmd, ServerCommand::Move { .. })
}

/// あるエンジンが受け取ったコマンド
pub fn received(spawner: &ScriptedSpawner, label: &str) -> Vec<String> {
    spawner
        .commands()
        .into_iter()
        .filter(|(l, _)| l == label)
        .map(|(_, c)| c)
        .collect()
}
