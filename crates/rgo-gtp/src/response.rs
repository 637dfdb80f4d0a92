//! エンジン出力の応答ブロック分割と、コマンド送信側のフレーミング
//!
//! GTP の応答は `=` / `?` で始まり空行で終わる。出力は行境界を保証しない
//! バイト列として届くため、[`ResponseFramer`] はバッファが終端マーカーで
//! 終わるまで溜め込み、完成した時点でまとめてブロックに分ける。
//! 応答に ID は無いので、呼び出し側は返された順に保留コマンドへ対応付ける。

use serde::{Deserialize, Serialize};

use crate::CodecError;

/// エンジンとの入出力形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireMode {
    /// 1行1コマンド、空行終端の応答
    #[default]
    Text,
    /// `{"commands": [...]}` を1つ送り、最後のコマンドで stdin を閉じる
    Json,
}

/// 分類済みの応答ブロック
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `=` 応答。ペイロードは前後空白を除いたもの
    Success(String),
    /// `?` 応答
    Failure(String),
    /// どちらでもない出力（プロトコル違反）。元のブロックを保持する
    Malformed(String),
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }
}

/// 応答ブロックを分類する。
pub fn classify(block: &str) -> Response {
    let block = block.trim_start();
    if let Some(rest) = block.strip_prefix('=') {
        Response::Success(rest.trim().to_string())
    } else if let Some(rest) = block.strip_prefix('?') {
        Response::Failure(rest.trim().to_string())
    } else {
        Response::Malformed(block.trim_end().to_string())
    }
}

/// エンジン stdout のバイト列を応答ブロックに分ける。
#[derive(Debug, Default)]
pub struct ResponseFramer {
    mode: WireMode,
    buffer: Vec<u8>,
}

impl ResponseFramer {
    pub fn new(mode: WireMode) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
        }
    }

    /// 未処理のまま溜まっているバイト数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// チャンクを追加し、完成した応答ブロックを返す。
    ///
    /// 終端に達していなければ空を返し、バッファはそのまま保持する。
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Response> {
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));
        match self.mode {
            WireMode::Text => self.drain_text(),
            WireMode::Json => self.drain_json(),
        }
    }

    fn drain_text(&mut self) -> Vec<Response> {
        if !self.buffer.ends_with(b"\n\n") {
            return Vec::new();
        }
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        text.split("\n\n")
            .filter(|block| !block.trim().is_empty())
            .map(classify)
            .collect()
    }

    fn drain_json(&mut self) -> Vec<Response> {
        let parsed = {
            let text = String::from_utf8_lossy(&self.buffer);
            let text = text.trim();
            if text.is_empty() {
                return Vec::new();
            }
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(v) => v,
                Err(_) => return Vec::new(),
            }
        };
        self.buffer.clear();
        match parsed {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => classify(&s),
                    other => Response::Malformed(other.to_string()),
                })
                .collect(),
            other => vec![Response::Malformed(other.to_string())],
        }
    }
}

/// 書き込むべきバイト列と、書き込み後に stdin を閉じるかどうか
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedCommand {
    pub bytes: String,
    pub close_stdin: bool,
}

/// コマンドを送信形式に整える。JSON 形式では配列の開閉を管理する。
#[derive(Debug, Default)]
pub struct CommandFramer {
    mode: WireMode,
    opened: bool,
    closed: bool,
}

impl CommandFramer {
    pub fn new(mode: WireMode) -> Self {
        Self {
            mode,
            opened: false,
            closed: false,
        }
    }

    pub fn mode(&self) -> WireMode {
        self.mode
    }

    /// 入力ストリームが既に閉じられているか（JSON 形式のみ）
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn frame(&mut self, command: &str, is_final: bool) -> Result<FramedCommand, CodecError> {
        if self.closed {
            return Err(CodecError::StreamClosed);
        }
        match self.mode {
            WireMode::Text => Ok(FramedCommand {
                bytes: format!("{}\n", command.trim_end()),
                close_stdin: false,
            }),
            WireMode::Json => {
                let mut bytes = String::new();
                if self.opened {
                    bytes.push(',');
                } else {
                    bytes.push_str("{\"commands\":[");
                    self.opened = true;
                }
                bytes.push_str(&serde_json::Value::from(command).to_string());
                if is_final {
                    bytes.push_str("]}\n");
                    self.closed = true;
                }
                Ok(FramedCommand {
                    bytes,
                    close_stdin: is_final,
                })
            }
        }
    }
}

/// `list_commands` などの複数行ペイロードを行ごとに分ける。
pub fn parse_list(payload: &str) -> Vec<String> {
    payload
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_blocks() {
        assert_eq!(classify("= Q4"), Response::Success("Q4".into()));
        assert_eq!(classify("=\n"), Response::Success(String::new()));
        assert_eq!(classify("? unknown command"), Response::Failure("unknown command".into()));
        assert_eq!(classify("garbage"), Response::Malformed("garbage".into()));
    }

    #[test]
    fn waits_for_terminator_across_chunks() {
        let mut framer = ResponseFramer::new(WireMode::Text);
        assert!(framer.feed(b"= ").is_empty());
        assert!(framer.feed(b"Q").is_empty());
        assert!(framer.feed(b"4\n").is_empty());
        assert_eq!(framer.feed(b"\n"), vec![Response::Success("Q4".into())]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn splits_several_blocks_in_one_chunk() {
        let mut framer = ResponseFramer::new(WireMode::Text);
        let out = framer.feed(b"=\n\n? illegal move\n\n= D4\n\n");
        assert_eq!(
            out,
            vec![
                Response::Success(String::new()),
                Response::Failure("illegal move".into()),
                Response::Success("D4".into()),
            ]
        );
    }

    #[test]
    fn holds_a_partial_trailing_block() {
        let mut framer = ResponseFramer::new(WireMode::Text);
        // 2ブロック目が未完のうちは1ブロック目も処理しない
        assert!(framer.feed(b"= A1\n\n= B").is_empty());
        let out = framer.feed(b"2\n\n");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn multiline_payload_and_crlf() {
        let mut framer = ResponseFramer::new(WireMode::Text);
        let out = framer.feed(b"= boardsize\r\ngenmove\r\nplay\r\n\r\n");
        assert_eq!(out, vec![Response::Success("boardsize\ngenmove\nplay".into())]);
        assert_eq!(parse_list("boardsize\ngenmove\nplay").len(), 3);
    }

    #[test]
    fn json_mode_waits_for_a_complete_document() {
        let mut framer = ResponseFramer::new(WireMode::Json);
        assert!(framer.feed(br#"["= ", "= Q"#).is_empty());
        let out = framer.feed(br#"4", "? bad", 3]"#);
        assert_eq!(
            out,
            vec![
                Response::Success(String::new()),
                Response::Success("Q4".into()),
                Response::Failure("bad".into()),
                Response::Malformed("3".into()),
            ]
        );
    }

    #[test]
    fn json_command_framing_closes_once() {
        let mut framer = CommandFramer::new(WireMode::Json);
        let first = framer.frame("boardsize 19", false).unwrap();
        assert_eq!(first.bytes, "{\"commands\":[\"boardsize 19\"");
        let last = framer.frame("genmove black", true).unwrap();
        assert_eq!(last.bytes, ",\"genmove black\"]}\n");
        assert!(last.close_stdin);
        assert!(framer.is_closed());
        assert_eq!(framer.frame("quit", true), Err(CodecError::StreamClosed));
    }

    #[test]
    fn text_command_framing() {
        let mut framer = CommandFramer::new(WireMode::Text);
        let framed = framer.frame("genmove white", true).unwrap();
        assert_eq!(framed.bytes, "genmove white\n");
        assert!(!framed.close_stdin);
        assert!(!framer.is_closed());
    }
}
