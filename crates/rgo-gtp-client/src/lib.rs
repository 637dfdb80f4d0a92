//! リアルタイム囲碁サーバと GTP エンジンの橋渡し
//!
//! - [`engine`]: エンジン子プロセスとのセッション（コマンドの直列化と応答の対応付け）
//! - [`clock`]: サーバ時計から GTP の時間管理コマンドへの変換
//! - [`game`]: 対局ごとの進行管理
//! - [`pool`]: 対局をまたいで使い回す常駐エンジン
//! - [`scheduler`]: 通信対局の計算順
//! - [`bridge`]: イベントの振り分けと定期処理
//! - [`transport`]: サーバとの JSON-lines 接続
//! - `testing`（`testing` feature）: 外部エンジン無しで動かすための台本エンジン

pub mod bridge;
pub mod clock;
pub mod commentary;
pub mod config;
pub mod engine;
pub mod error;
pub mod game;
pub mod pool;
pub mod protocol;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use engine::{Capabilities, EngineRole, EngineSession, EngineSpawner, ProcessSpawner};
pub use error::{EngineError, PoolError};
pub use game::{EngineSource, GameInput};
pub use pool::EnginePool;
pub use protocol::{ServerCommand, ServerEvent};
pub use transport::JsonLinesTransport;
