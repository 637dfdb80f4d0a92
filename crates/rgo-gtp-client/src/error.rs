//! エンジン・プール操作のエラー型

use rgo_gtp::CodecError;

/// エンジンセッションで起きるエラー
///
/// いずれも対局の外へは伝播させず、対局ごとに再試行か投了へ解決する。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// プロセス起動に失敗した
    #[error("failed to spawn engine `{command}`: {message}")]
    Spawn { command: String, message: String },

    /// プロセスが終了済み、または入出力が壊れている
    #[error("{label}: engine is dead")]
    Dead { label: String },

    /// stdin への書き込み失敗など
    #[error("{label}: I/O error: {message}")]
    Io { label: String, message: String },

    /// `?` 応答
    #[error("{label}: `{command}` failed: {message}")]
    CommandFailed {
        label: String,
        command: String,
        message: String,
    },

    /// `=` でも `?` でもない出力
    #[error("{label}: protocol violation after `{command}`: {output}")]
    Protocol {
        label: String,
        command: String,
        output: String,
    },

    /// 応答は成功したが内容が使えない（座標が読めない、置石の数が違う等）
    #[error("{label}: invalid response to `{command}`: {message}")]
    InvalidResponse {
        label: String,
        command: String,
        message: String,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl EngineError {
    /// プロセスの死亡・入出力の断絶によるものか
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Spawn { .. } | EngineError::Dead { .. } | EngineError::Io { .. })
    }
}

/// エンジンプールのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// 直前の起動から短時間で再起動が必要になった（起動直後に落ち続けている）
    #[error("engine crash loop: respawned {elapsed_ms}ms after the previous spawn")]
    CrashLoop { elapsed_ms: u64 },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("engine pool is shut down")]
    Closed,
}
