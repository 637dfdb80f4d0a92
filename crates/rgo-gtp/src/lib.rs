//! GTP (Go Text Protocol) 側のコーデック
//!
//! - [`vertex`]: 盤上座標とエンジン表記 / サーバ短縮表記の変換
//! - [`moves`]: 指し手と棋譜ペイロード（配列形式・文字列形式）のデコード
//! - [`response`]: エンジン出力の応答ブロック分割とコマンド送信フレーミング
//!
//! I/O を一切持たない純粋な型と関数のみを置く。

pub mod color;
pub mod moves;
pub mod response;
pub mod vertex;

pub use color::Color;
pub use moves::{Move, MoveHistory, decode_compact, encode_compact};
pub use response::{CommandFramer, FramedCommand, Response, ResponseFramer, WireMode};
pub use vertex::{MAX_BOARD_SIZE, Vertex};

/// 座標・棋譜・送信フレーミングのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid vertex: {0}")]
    InvalidVertex(String),

    #[error("vertex ({x}, {y}) is off a {width}x{height} board")]
    OffBoard {
        x: i32,
        y: i32,
        width: usize,
        height: usize,
    },

    #[error("unsupported board size {width}x{height}")]
    UnsupportedBoard { width: usize, height: usize },

    #[error("invalid move history: {0}")]
    InvalidHistory(String),

    #[error("`{0}` is not a board move")]
    NotABoardMove(String),

    #[error("command stream already closed")]
    StreamClosed,
}
