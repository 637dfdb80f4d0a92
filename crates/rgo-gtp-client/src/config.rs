//! ブリッジ設定（TOML）
//!
//! すべてのセクションは省略可能で、省略時は既定値を使う。
//! 読み込み時の検査は実行時に破綻する組み合わせだけに留める。

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use rgo_gtp::WireMode;

use crate::clock::ClockOffset;
use crate::commentary::Family;
use crate::protocol::{ChatChannel, PlayerId, Speed};

/// ブリッジ全体の設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// サーバ上のボットのプレイヤー ID
    pub bot_id: PlayerId,
    pub engine: EngineConfig,
    /// 投了判断だけに使う第2エンジン
    pub advisor: Option<EngineConfig>,
    pub game: GameConfig,
    pub persist: PersistConfig,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub idle: IdleConfig,
    pub clock: ClockConfig,
}

/// エンジンプロセスの起動設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    pub wire: WireMode,
    /// stderr の解析行の書式
    pub family: Family,
}

/// 対局ごとの進行設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// セッション最初の着手でだけ持ち時間から差し引く猶予
    pub startup_buffer_ms: u64,
    /// これより早く応答が来ても着手の送信を遅らせる
    pub min_move_time_ms: u64,
    /// 同一ロールの連続失敗がこの回数に達したら投了（助言役は無効化）
    pub max_failures: u32,
    /// `quit` 後に強制終了するまでの猶予
    pub kill_grace_ms: u64,
    /// 盤面の再構築後に `showboard` を送り debug ログに残す
    pub showboard: bool,
    pub analysis_channel: ChatChannel,
    /// エンジンの解析行をチャットに流す
    pub commentary: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            startup_buffer_ms: 5000,
            min_move_time_ms: 0,
            max_failures: 3,
            kill_grace_ms: 5000,
            showboard: false,
            analysis_channel: ChatChannel::Malkovich,
            commentary: false,
        }
    }
}

impl GameConfig {
    pub fn min_move_time(&self) -> Duration {
        Duration::from_millis(self.min_move_time_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// 着手後もエンジンを起動したままにするか（速度区分ごと）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub blitz: bool,
    pub rapid: bool,
    pub live: bool,
    pub correspondence: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            blitz: true,
            rapid: true,
            live: true,
            correspondence: false,
        }
    }
}

impl PersistConfig {
    pub fn for_speed(&self, speed: Speed) -> bool {
        match speed {
            Speed::Blitz => self.blitz,
            Speed::Rapid => self.rapid,
            Speed::Live => self.live,
            Speed::Correspondence => self.correspondence,
        }
    }
}

/// 常駐エンジンプール。`size = 0` で無効。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    /// 前回の起動からこれより短い間隔で再起動が必要になったらクラッシュループとみなす
    pub min_respawn_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 0,
            min_respawn_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub correspondence_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            correspondence_interval_ms: 1000,
        }
    }
}

/// 相手が長く着手しない対局から切断する監視
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub check_interval_ms: u64,
    pub live_timeout_secs: u64,
    pub correspondence_timeout_secs: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            live_timeout_secs: 1800,
            correspondence_timeout_secs: 2 * 24 * 3600,
        }
    }
}

impl IdleConfig {
    pub fn timeout(&self, speed: Speed) -> Duration {
        match speed {
            Speed::Correspondence => Duration::from_secs(self.correspondence_timeout_secs),
            _ => Duration::from_secs(self.live_timeout_secs),
        }
    }
}

/// 時計補正の初期値。接続後は `clock_sync` イベントで更新される。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub drift_ms: f64,
    pub latency_ms: f64,
}

impl ClockConfig {
    pub fn offset(&self) -> ClockOffset {
        ClockOffset {
            drift_ms: self.drift_ms,
            latency_ms: self.latency_ms,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.command.trim().is_empty() {
            bail!("engine.command must not be empty");
        }
        if self.advisor.as_ref().is_some_and(|a| a.command.trim().is_empty()) {
            bail!("advisor.command must not be empty");
        }
        // JSON 形式は1局面ごとに stdin を閉じるので、使い回すプールとは両立しない
        if self.pool.size > 0 && self.engine.wire == WireMode::Json {
            bail!("pool.size > 0 cannot be combined with engine.wire = \"json\"");
        }
        if self.game.max_failures == 0 {
            bail!("game.max_failures must be at least 1");
        }
        Ok(())
    }

    pub fn pool_enabled(&self) -> bool {
        self.pool.size > 0
    }
}
