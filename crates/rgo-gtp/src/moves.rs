//! 指し手（Move）と棋譜ペイロードのデコード

use serde::{Deserialize, Serialize};

use crate::CodecError;
use crate::vertex::{ENGINE_PASS, SERVER_PASS, Vertex};

/// 投了を表すエンジン応答。
pub const ENGINE_RESIGN: &str = "resign";

/// 1手。`x < 0` は盤上の点を持たない（パス・投了）ことを表す。
///
/// `text` はエンジン表記（`Q4` / `pass` / `resign`）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub x: i32,
    pub y: i32,
    pub pass: bool,
    pub resign: bool,
    pub text: String,
}

impl Move {
    pub fn pass() -> Self {
        Self {
            x: -1,
            y: -1,
            pass: true,
            resign: false,
            text: ENGINE_PASS.to_string(),
        }
    }

    pub fn resign() -> Self {
        Self {
            x: -1,
            y: -1,
            pass: false,
            resign: true,
            text: ENGINE_RESIGN.to_string(),
        }
    }

    /// 盤上の着手を作る。
    pub fn at(v: Vertex, width: usize, height: usize) -> Result<Self, CodecError> {
        let text = v.to_engine(width, height)?;
        Ok(Self {
            x: v.x as i32,
            y: v.y as i32,
            pass: false,
            resign: false,
            text,
        })
    }

    /// 盤上の点（パス・投了なら `None`）
    pub fn vertex(&self) -> Option<Vertex> {
        if self.x < 0 || self.y < 0 {
            None
        } else {
            Some(Vertex::new(self.x as usize, self.y as usize))
        }
    }

    /// `genmove` / `place_free_handicap` 応答の1トークンを読む。
    pub fn from_engine(text: &str, width: usize, height: usize) -> Result<Self, CodecError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(ENGINE_RESIGN) {
            return Ok(Self::resign());
        }
        match Vertex::from_engine(text, width, height)? {
            Some(v) => Self::at(v, width, height),
            None => Ok(Self::pass()),
        }
    }

    /// サーバ座標 `(x, y)` から作る。`x < 0` はパス。
    pub fn from_coords(x: i64, y: i64, width: usize, height: usize) -> Result<Self, CodecError> {
        if x < 0 {
            return Ok(Self::pass());
        }
        if y < 0 || x as usize >= width || y as usize >= height {
            return Err(CodecError::OffBoard {
                x: x as i32,
                y: y as i32,
                width,
                height,
            });
        }
        Self::at(Vertex::new(x as usize, y as usize), width, height)
    }

    /// サーバ短縮表記の2文字から作る。
    pub fn from_server(pair: &str, width: usize, height: usize) -> Result<Self, CodecError> {
        match Vertex::from_server(pair)? {
            Some(v) if v.is_on_board(width, height) => Self::at(v, width, height),
            Some(v) => Err(CodecError::OffBoard {
                x: v.x as i32,
                y: v.y as i32,
                width,
                height,
            }),
            None => Ok(Self::pass()),
        }
    }

    /// サーバへ送る短縮表記。投了は着手として送れないためエラー。
    pub fn to_server(&self) -> Result<String, CodecError> {
        if self.resign {
            return Err(CodecError::NotABoardMove(self.text.clone()));
        }
        match self.vertex() {
            Some(v) => v.to_server(),
            None => Ok(SERVER_PASS.to_string()),
        }
    }

    /// エンジンへ送る `play` 用の頂点表記。
    pub fn to_engine(&self, width: usize, height: usize) -> Result<String, CodecError> {
        if self.resign {
            return Err(CodecError::NotABoardMove(self.text.clone()));
        }
        match self.vertex() {
            Some(v) => v.to_engine(width, height),
            None => Ok(ENGINE_PASS.to_string()),
        }
    }
}

/// サーバの棋譜ペイロード。配列形式 `[[x, y, ms], ...]` と短縮文字列形式の両方を受ける。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MoveHistory {
    Array(Vec<Vec<serde_json::Value>>),
    Compact(String),
}

impl Default for MoveHistory {
    fn default() -> Self {
        MoveHistory::Array(Vec::new())
    }
}

impl MoveHistory {
    /// 棋譜の手数（デコードせずに数える）
    pub fn len(&self) -> usize {
        match self {
            MoveHistory::Array(moves) => moves.len(),
            MoveHistory::Compact(s) => s.len() / 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 末尾に1手追加する。短縮形式なら2文字、配列形式なら `[x, y]` を足す。
    pub fn push(&mut self, mv: &Move) -> Result<(), CodecError> {
        match self {
            MoveHistory::Array(moves) => {
                moves.push(vec![serde_json::Value::from(mv.x), serde_json::Value::from(mv.y)]);
            }
            MoveHistory::Compact(s) => s.push_str(&mv.to_server()?),
        }
        Ok(())
    }

    /// 全手をデコードする。
    pub fn decode(&self, width: usize, height: usize) -> Result<Vec<Move>, CodecError> {
        match self {
            MoveHistory::Array(moves) => moves
                .iter()
                .map(|entry| {
                    let (x, y) = coords_of(entry)?;
                    Move::from_coords(x, y, width, height)
                })
                .collect(),
            MoveHistory::Compact(s) => decode_compact(s, width, height),
        }
    }
}

/// 短縮文字列形式（2文字ずつ）をデコードする。
pub fn decode_compact(s: &str, width: usize, height: usize) -> Result<Vec<Move>, CodecError> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return Err(CodecError::InvalidHistory(s.to_string()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| Move::from_server(&s[i..i + 2], width, height))
        .collect()
}

/// 盤上の点の列を短縮文字列形式にする（読み筋の送信などで使う）。
pub fn encode_compact(moves: &[Move]) -> Result<String, CodecError> {
    let mut out = String::with_capacity(moves.len() * 2);
    for mv in moves {
        out.push_str(&mv.to_server()?);
    }
    Ok(out)
}

/// `[x, y, ...]` の先頭2要素を座標として取り出す。
pub fn coords_of(entry: &[serde_json::Value]) -> Result<(i64, i64), CodecError> {
    let invalid = || CodecError::InvalidHistory(serde_json::Value::from(entry.to_vec()).to_string());
    let x = entry.first().and_then(as_coordinate).ok_or_else(invalid)?;
    let y = entry.get(1).and_then(as_coordinate).ok_or_else(invalid)?;
    Ok((x, y))
}

fn as_coordinate(v: &serde_json::Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn genmove_tokens() {
        let mv = Move::from_engine("Q4", 19, 19).unwrap();
        assert_eq!((mv.x, mv.y), (15, 15));
        assert_eq!(mv.to_server().unwrap(), "pp");
        assert!(Move::from_engine("pass", 19, 19).unwrap().pass);
        assert!(Move::from_engine("Resign", 19, 19).unwrap().resign);
        assert!(Move::from_engine("Z99", 19, 19).is_err());
    }

    #[test]
    fn pass_is_consistent_in_both_encodings() {
        let pass = Move::pass();
        assert!(pass.x < 0);
        assert_eq!(pass.to_server().unwrap(), "..");
        assert_eq!(pass.to_engine(19, 19).unwrap(), "pass");
        assert_eq!(Move::from_server("..", 19, 19).unwrap(), pass);
        assert_eq!(Move::from_coords(-1, -1, 19, 19).unwrap(), pass);
    }

    #[test]
    fn resign_is_not_sent_as_a_move() {
        assert!(Move::resign().to_server().is_err());
        assert!(Move::resign().to_engine(19, 19).is_err());
    }

    #[test]
    fn decode_array_history() {
        let history: MoveHistory =
            serde_json::from_value(json!([[15, 3, 1200], [3, 15, 800.5], [-1, -1, 300]])).unwrap();
        let moves = history.decode(19, 19).unwrap();
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[0].text, "Q16");
        assert_eq!(moves[1].text, "D4");
        assert!(moves[2].pass);
    }

    #[test]
    fn decode_compact_history() {
        let history: MoveHistory = serde_json::from_value(json!("pddp..")).unwrap();
        assert_eq!(history.len(), 3);
        let moves = history.decode(19, 19).unwrap();
        assert_eq!(moves[0].text, "Q16");
        assert_eq!(moves[1].text, "D4");
        assert!(moves[2].pass);
        assert!(decode_compact("pdd", 19, 19).is_err());
    }

    #[test]
    fn push_keeps_encoding() {
        let mut compact = MoveHistory::Compact("pd".to_string());
        compact.push(&Move::pass()).unwrap();
        assert_eq!(compact, MoveHistory::Compact("pd..".to_string()));

        let mut array = MoveHistory::default();
        array.push(&Move::from_engine("D4", 19, 19).unwrap()).unwrap();
        assert_eq!(array.decode(19, 19).unwrap()[0].text, "D4");
    }

    #[test]
    fn off_board_history_is_rejected() {
        let history: MoveHistory = serde_json::from_value(json!([[9, 9]])).unwrap();
        assert!(history.decode(9, 9).is_err());
        assert!(decode_compact("ss", 9, 9).is_err());
    }

    #[test]
    fn encode_pv() {
        let pv: Vec<Move> = ["Q16", "D4", "pass"]
            .iter()
            .map(|t| Move::from_engine(t, 19, 19).unwrap())
            .collect();
        assert_eq!(encode_compact(&pv).unwrap(), "pddp..");
    }
}
