//! 盤上座標（Vertex）と2種類の表記の相互変換
//!
//! - エンジン側 (GTP): 列は `I` を除く25文字、行は下から1始まり（例: `Q4`）
//! - サーバ側（短縮表記）: 列・行とも `a`〜`z` の2文字、行は上から（例: `pp`）
//!
//! パスはそれぞれ `pass` / `..` で表す。

use std::fmt;

use crate::CodecError;

/// エンジン表記の列文字。`I` は `L` / `1` と紛らわしいため含まない。
pub const ENGINE_COLUMNS: &[u8; 25] = b"ABCDEFGHJKLMNOPQRSTUVWXYZ";

/// サーバ短縮表記の文字列（列・行共通）。
pub const SERVER_LETTERS: &[u8; 26] = b"abcdefghijklmnopqrstuvwxyz";

/// 対応できる最大の盤サイズ（エンジン表記の列数で決まる）。
pub const MAX_BOARD_SIZE: usize = ENGINE_COLUMNS.len();

/// サーバ表記のパス。
pub const SERVER_PASS: &str = "..";

/// エンジン表記のパス。
pub const ENGINE_PASS: &str = "pass";

/// 盤上の1点。`x` は左から、`y` は上からの0始まり。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vertex {
    pub x: usize,
    pub y: usize,
}

impl Vertex {
    #[inline]
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// 盤サイズ内に収まっているか
    #[inline]
    pub fn is_on_board(self, width: usize, height: usize) -> bool {
        self.x < width && self.y < height
    }

    /// エンジン表記（例: `Q4`）に変換する。
    pub fn to_engine(self, width: usize, height: usize) -> Result<String, CodecError> {
        check_board(width, height)?;
        if !self.is_on_board(width, height) {
            return Err(CodecError::OffBoard {
                x: self.x as i32,
                y: self.y as i32,
                width,
                height,
            });
        }
        let column = ENGINE_COLUMNS[self.x] as char;
        Ok(format!("{}{}", column, height - self.y))
    }

    /// エンジン表記から読み取る。`pass` は `Ok(None)`。
    pub fn from_engine(text: &str, width: usize, height: usize) -> Result<Option<Self>, CodecError> {
        check_board(width, height)?;
        let text = text.trim();
        if text.eq_ignore_ascii_case(ENGINE_PASS) {
            return Ok(None);
        }
        let mut chars = text.chars();
        let column = chars
            .next()
            .ok_or_else(|| CodecError::InvalidVertex(text.to_string()))?
            .to_ascii_uppercase();
        let x = ENGINE_COLUMNS
            .iter()
            .position(|&c| c as char == column)
            .ok_or_else(|| CodecError::InvalidVertex(text.to_string()))?;
        let row: usize =
            chars.as_str().parse().map_err(|_| CodecError::InvalidVertex(text.to_string()))?;
        if row == 0 || row > height || x >= width {
            return Err(CodecError::InvalidVertex(text.to_string()));
        }
        Ok(Some(Self::new(x, height - row)))
    }

    /// サーバ短縮表記（例: `pp`）に変換する。
    pub fn to_server(self) -> Result<String, CodecError> {
        if self.x >= SERVER_LETTERS.len() || self.y >= SERVER_LETTERS.len() {
            return Err(CodecError::OffBoard {
                x: self.x as i32,
                y: self.y as i32,
                width: SERVER_LETTERS.len(),
                height: SERVER_LETTERS.len(),
            });
        }
        let mut s = String::with_capacity(2);
        s.push(SERVER_LETTERS[self.x] as char);
        s.push(SERVER_LETTERS[self.y] as char);
        Ok(s)
    }

    /// サーバ短縮表記の2文字から読み取る。`..` は `Ok(None)`。
    pub fn from_server(pair: &str) -> Result<Option<Self>, CodecError> {
        if pair == SERVER_PASS {
            return Ok(None);
        }
        let bytes = pair.as_bytes();
        if bytes.len() != 2 {
            return Err(CodecError::InvalidVertex(pair.to_string()));
        }
        let x = server_index(bytes[0]).ok_or_else(|| CodecError::InvalidVertex(pair.to_string()))?;
        let y = server_index(bytes[1]).ok_or_else(|| CodecError::InvalidVertex(pair.to_string()))?;
        Ok(Some(Self::new(x, y)))
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

fn server_index(b: u8) -> Option<usize> {
    SERVER_LETTERS.iter().position(|&c| c == b)
}

fn check_board(width: usize, height: usize) -> Result<(), CodecError> {
    if width == 0 || height == 0 || width > MAX_BOARD_SIZE || height > MAX_BOARD_SIZE {
        return Err(CodecError::UnsupportedBoard { width, height });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_notation_skips_i() {
        assert_eq!(Vertex::new(7, 0).to_engine(19, 19).unwrap(), "H19");
        assert_eq!(Vertex::new(8, 0).to_engine(19, 19).unwrap(), "J19");
        assert_eq!(Vertex::new(15, 15).to_engine(19, 19).unwrap(), "Q4");
        assert_eq!(Vertex::new(0, 18).to_engine(19, 19).unwrap(), "A1");
    }

    #[test]
    fn engine_parse_is_case_insensitive() {
        assert_eq!(Vertex::from_engine("q4", 19, 19).unwrap(), Some(Vertex::new(15, 15)));
        assert_eq!(Vertex::from_engine("PASS", 19, 19).unwrap(), None);
        assert!(Vertex::from_engine("I5", 19, 19).is_err());
        assert!(Vertex::from_engine("A0", 19, 19).is_err());
        assert!(Vertex::from_engine("A20", 19, 19).is_err());
        assert!(Vertex::from_engine("T1", 9, 9).is_err());
    }

    #[test]
    fn server_notation() {
        assert_eq!(Vertex::new(15, 3).to_server().unwrap(), "pd");
        assert_eq!(Vertex::from_server("pd").unwrap(), Some(Vertex::new(15, 3)));
        assert_eq!(Vertex::from_server("..").unwrap(), None);
        assert!(Vertex::from_server("p").is_err());
        assert!(Vertex::from_server("P1").is_err());
    }

    #[test]
    fn round_trip_every_point_on_every_board() {
        for size in 1..=MAX_BOARD_SIZE {
            for x in 0..size {
                for y in 0..size {
                    let v = Vertex::new(x, y);
                    let engine = v.to_engine(size, size).unwrap();
                    assert_eq!(Vertex::from_engine(&engine, size, size).unwrap(), Some(v));
                    let server = v.to_server().unwrap();
                    assert_eq!(Vertex::from_server(&server).unwrap(), Some(v));
                }
            }
        }
    }

    #[test]
    fn oversized_board_is_rejected() {
        assert!(matches!(
            Vertex::new(0, 0).to_engine(26, 26),
            Err(CodecError::UnsupportedBoard { .. })
        ));
    }
}
