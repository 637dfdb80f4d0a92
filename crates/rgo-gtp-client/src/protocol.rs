//! サーバとの間でやり取りするイベント・コマンドの型
//!
//! ソケットの送受信自体は [`crate::transport`] が担い、ここでは対局ごとの
//! スナップショット・差分・時計と、こちらから送る操作だけを定義する。

use serde::{Deserialize, Serialize};

use rgo_gtp::{Color, MoveHistory};

pub type GameId = u64;
pub type PlayerId = u64;

/// 対局の進行段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Play,
    #[serde(rename = "stone removal")]
    StoneRemoval,
    Finished,
    #[serde(other)]
    Other,
}

/// 持ち時間の速度区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Blitz,
    Rapid,
    #[default]
    Live,
    Correspondence,
}

/// 持ち時間の方式。秒単位。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "system", rename_all = "lowercase")]
pub enum TimeControl {
    Canadian {
        main_time: f64,
        period_time: f64,
        stones_per_period: u32,
        #[serde(default)]
        speed: Speed,
    },
    Byoyomi {
        main_time: f64,
        period_time: f64,
        periods: u32,
        #[serde(default)]
        speed: Speed,
    },
    Fischer {
        initial_time: f64,
        time_increment: f64,
        max_time: f64,
        #[serde(default)]
        speed: Speed,
    },
    Simple {
        per_move: f64,
        #[serde(default)]
        speed: Speed,
    },
    Absolute {
        total_time: f64,
        #[serde(default)]
        speed: Speed,
    },
    /// 時間無制限、または未対応の方式
    #[default]
    #[serde(other)]
    None,
}

impl TimeControl {
    /// 速度区分。時間無制限は通信対局扱い。
    pub fn speed(&self) -> Speed {
        match self {
            TimeControl::Canadian { speed, .. }
            | TimeControl::Byoyomi { speed, .. }
            | TimeControl::Fischer { speed, .. }
            | TimeControl::Simple { speed, .. }
            | TimeControl::Absolute { speed, .. } => *speed,
            TimeControl::None => Speed::Correspondence,
        }
    }
}

/// 片側の時計。単純方式ではサーバは数値（期限）だけを送ってくる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClockSide {
    Detailed(PeriodClock),
    Deadline(f64),
}

impl ClockSide {
    pub fn detailed(&self) -> PeriodClock {
        match self {
            ClockSide::Detailed(c) => *c,
            ClockSide::Deadline(_) => PeriodClock::default(),
        }
    }
}

/// 方式ごとに使うフィールドだけが意味を持つ。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodClock {
    /// 残りの持ち時間（秒）
    pub thinking_time: f64,
    /// 秒読み: 残り回数
    pub periods: u32,
    /// 秒読み: 1回あたりの時間
    pub period_time: f64,
    /// カナダ式: 現在のブロックで打つべき残り手数
    pub moves_left: u32,
    /// カナダ式: 現在のブロックの残り時間
    pub block_time: f64,
}

/// 一時停止の状態
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PauseState {
    pub paused: bool,
    pub paused_since: Option<f64>,
    /// 対局者の要求による停止なら、その対局者
    pub pausing_player_id: Option<PlayerId>,
}

/// サーバ時計のスナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    pub game_id: GameId,
    pub current_player: PlayerId,
    pub black_player_id: PlayerId,
    pub white_player_id: PlayerId,
    /// 直前の着手時刻（ms, epoch）
    pub last_move: f64,
    /// サーバが付けてくる現在時刻（ms, epoch）
    #[serde(default)]
    pub now: Option<f64>,
    #[serde(default)]
    pub expiration: Option<f64>,
    pub black_time: ClockSide,
    pub white_time: ClockSide,
    #[serde(default)]
    pub pause: Option<PauseState>,
}

impl Clock {
    pub fn side(&self, color: Color) -> &ClockSide {
        match color {
            Color::Black => &self.black_time,
            Color::White => &self.white_time,
        }
    }

    /// 手番側の色。どちらの ID とも一致しなければ `None`。
    pub fn color_to_move(&self) -> Option<Color> {
        if self.current_player == self.black_player_id {
            Some(Color::Black)
        } else if self.current_player == self.white_player_id {
            Some(Color::White)
        } else {
            None
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause.as_ref().is_some_and(|p| p.paused)
    }
}

/// 初期配置（置石など）。サーバ短縮表記の連結。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialState {
    pub black: String,
    pub white: String,
}

/// 対局状態のスナップショット。新しいものが届いたら丸ごと置き換える。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    pub game_id: GameId,
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub komi: f64,
    #[serde(default)]
    pub handicap: u32,
    #[serde(default)]
    pub free_handicap_placement: bool,
    #[serde(default)]
    pub initial_player: Option<Color>,
    #[serde(default)]
    pub initial_state: InitialState,
    #[serde(default)]
    pub moves: MoveHistory,
    pub black_player_id: PlayerId,
    pub white_player_id: PlayerId,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub time_control: TimeControl,
    #[serde(default)]
    pub clock: Option<Clock>,
}

impl MatchState {
    /// `player` の色。対局者でなければ `None`。
    pub fn color_of(&self, player: PlayerId) -> Option<Color> {
        if player == self.black_player_id {
            Some(Color::Black)
        } else if player == self.white_player_id {
            Some(Color::White)
        } else {
            None
        }
    }

    /// 時計など進行とともに変わるだけの項目を除いて同一か。
    ///
    /// 異なる場合、生きているエンジンの盤面は信用できないので作り直す。
    pub fn same_position_as(&self, other: &MatchState) -> bool {
        let strip = |s: &MatchState| MatchState {
            clock: None,
            moves: MoveHistory::default(),
            ..s.clone()
        };
        if strip(self) != strip(other) {
            return false;
        }
        // 経過時間などを落とした座標だけで比べる
        match (
            self.moves.decode(self.width, self.height),
            other.moves.decode(other.width, other.height),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// 1手の差分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEvent {
    pub game_id: GameId,
    /// この手を含めた手数（1始まり）
    pub move_number: usize,
    /// `[x, y, ms]`。`x < 0` はパス。
    #[serde(rename = "move")]
    pub coords: Vec<serde_json::Value>,
}

/// サーバから届くイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Gamedata(MatchState),
    Move(MoveEvent),
    Phase { game_id: GameId, phase: Phase },
    Clock(Clock),
    /// 通信路側で測った時計のずれと遅延（ms）
    ClockSync { drift_ms: f64, latency_ms: f64 },
}

impl ServerEvent {
    pub fn game_id(&self) -> Option<GameId> {
        match self {
            ServerEvent::Gamedata(s) => Some(s.game_id),
            ServerEvent::Move(m) => Some(m.game_id),
            ServerEvent::Phase { game_id, .. } => Some(*game_id),
            ServerEvent::Clock(c) => Some(c.game_id),
            ServerEvent::ClockSync { .. } => None,
        }
    }
}

/// チャットの送り先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatChannel {
    /// 対局者・観戦者に見える公開チャット
    Main,
    /// 終局後に公開される解析用の非公開チャンネル
    #[default]
    Malkovich,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisMarks {
    pub circle: String,
}

/// 解析チャットのペイロード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisChat {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub from: usize,
    pub moves: String,
    pub marks: AnalysisMarks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatBody {
    Text(String),
    Analysis(AnalysisChat),
}

/// こちらからサーバへ送る操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerCommand {
    Connect {
        game_id: GameId,
    },
    Disconnect {
        game_id: GameId,
    },
    Move {
        game_id: GameId,
        #[serde(rename = "move")]
        mv: String,
    },
    Resign {
        game_id: GameId,
    },
    Chat {
        game_id: GameId,
        channel: ChatChannel,
        move_number: usize,
        body: ChatBody,
    },
    Pause {
        game_id: GameId,
    },
    Resume {
        game_id: GameId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gamedata() -> serde_json::Value {
        json!({
            "event": "gamedata",
            "game_id": 42,
            "width": 19,
            "height": 19,
            "komi": 6.5,
            "handicap": 0,
            "moves": [[15, 3, 1000]],
            "black_player_id": 1,
            "white_player_id": 2,
            "phase": "play",
            "time_control": {
                "system": "byoyomi",
                "main_time": 600,
                "period_time": 30,
                "periods": 5,
                "speed": "live"
            },
            "clock": {
                "game_id": 42,
                "current_player": 2,
                "black_player_id": 1,
                "white_player_id": 2,
                "last_move": 1700000000000.0,
                "black_time": {"thinking_time": 590.5, "periods": 5, "period_time": 30},
                "white_time": {"thinking_time": 600, "periods": 5, "period_time": 30}
            }
        })
    }

    #[test]
    fn parses_gamedata_event() {
        let ev: ServerEvent = serde_json::from_value(gamedata()).unwrap();
        let ServerEvent::Gamedata(state) = ev else {
            panic!("expected gamedata");
        };
        assert_eq!(state.game_id, 42);
        assert_eq!(state.moves.len(), 1);
        assert_eq!(state.color_of(2), Some(Color::White));
        assert_eq!(state.time_control.speed(), Speed::Live);
        let clock = state.clock.as_ref().unwrap();
        assert_eq!(clock.color_to_move(), Some(Color::White));
        assert_eq!(clock.black_time.detailed().thinking_time, 590.5);
    }

    #[test]
    fn unknown_time_system_and_phase_fall_back() {
        let tc: TimeControl = serde_json::from_value(json!({"system": "hourglass"})).unwrap();
        assert_eq!(tc, TimeControl::None);
        assert_eq!(tc.speed(), Speed::Correspondence);
        let phase: Phase = serde_json::from_value(json!("stone removal")).unwrap();
        assert_eq!(phase, Phase::StoneRemoval);
        let phase: Phase = serde_json::from_value(json!("scoring")).unwrap();
        assert_eq!(phase, Phase::Other);
    }

    #[test]
    fn simple_clock_side_is_a_number() {
        let side: ClockSide = serde_json::from_value(json!(1700000030000.0)).unwrap();
        assert_eq!(side, ClockSide::Deadline(1_700_000_030_000.0));
        assert_eq!(side.detailed(), PeriodClock::default());
    }

    #[test]
    fn clock_changes_do_not_change_position() {
        let ServerEvent::Gamedata(a) = serde_json::from_value::<ServerEvent>(gamedata()).unwrap() else {
            panic!();
        };
        let mut b = a.clone();
        if let Some(clock) = b.clock.as_mut() {
            clock.last_move += 5000.0;
        }
        assert!(a.same_position_as(&b));
        b.komi = 0.5;
        assert!(!a.same_position_as(&b));
    }

    #[test]
    fn commands_serialize_with_tags() {
        let cmd = ServerCommand::Move {
            game_id: 7,
            mv: "pp".into(),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"command": "move", "game_id": 7, "move": "pp"})
        );
        let chat = ServerCommand::Chat {
            game_id: 7,
            channel: ChatChannel::Main,
            move_number: 3,
            body: ChatBody::Text("hi".into()),
        };
        assert_eq!(serde_json::to_value(&chat).unwrap()["body"], json!("hi"));
    }
}
