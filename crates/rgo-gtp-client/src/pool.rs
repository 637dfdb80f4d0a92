//! 常駐エンジンのプール
//!
//! 複数の対局で N 本のエンジンを使い回す。貸し出しは1本につき1対局ずつで、
//! 空きが無ければ先着順に待たせる。返却時に死んでいたものは作り直すが、
//! 起動直後に落ちた（クラッシュループ）場合は作り直さずにプールを閉じる。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::oneshot;

use crate::engine::{EngineRole, EngineSession, EngineSpawner};
use crate::error::PoolError;

#[derive(Default)]
struct PoolState {
    idle: VecDeque<EngineSession>,
    waiters: VecDeque<oneshot::Sender<EngineSession>>,
    closed: bool,
    /// 閉じた後に返却されたものを終了させる猶予
    grace: Duration,
}

struct PoolInner {
    spawner: Arc<dyn EngineSpawner>,
    size: usize,
    min_respawn: Duration,
    state: Mutex<PoolState>,
}

/// 複製しても同じプールを指す。
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

impl EnginePool {
    /// `size` 本を起動して空きに並べる。
    pub async fn start(
        spawner: Arc<dyn EngineSpawner>,
        size: usize,
        min_respawn: Duration,
    ) -> Result<Self, PoolError> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                spawner,
                size,
                min_respawn,
                state: Mutex::new(PoolState::default()),
            }),
        };
        for _ in 0..size {
            let session = pool.spawn_one().await?;
            pool.lock().idle.push_back(session);
        }
        info!("engine pool started with {size} engines");
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn spawn_one(&self) -> Result<EngineSession, PoolError> {
        let session = self.inner.spawner.spawn(EngineRole::Primary, None)?;
        session.probe_capabilities().await?;
        Ok(session)
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle_len(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// 空きを1本借りる。空きが無ければ返却を待つ。
    ///
    /// 空きのまま落ちていたものは作り直してから渡す。
    pub async fn acquire(&self) -> Result<EngineSession, PoolError> {
        let rx = {
            let mut st = self.lock();
            if st.closed {
                return Err(PoolError::Closed);
            }
            match st.idle.pop_front() {
                Some(session) if session.is_dead() => Err(session),
                Some(session) => return Ok(session),
                None => {
                    let (tx, rx) = oneshot::channel();
                    st.waiters.push_back(tx);
                    Ok(rx)
                }
            }
        };
        match rx {
            Ok(rx) => rx.await.map_err(|_| PoolError::Closed),
            Err(dead) => self.replace(dead).await,
        }
    }

    /// 借りたものを返す。死んでいれば作り直してから次の待ち手へ回す。
    pub async fn release(&self, session: EngineSession) -> Result<(), PoolError> {
        let session = if session.is_dead() {
            self.replace(session).await?
        } else {
            session
        };
        self.hand_over(session);
        Ok(())
    }

    /// 状態が信用できなくなったものを終了させ、作り直して返す。
    ///
    /// 既に自分で落ちていたものは返却時と同じくクラッシュループを判定する。
    pub async fn discard(&self, session: EngineSession, grace: Duration) -> Result<(), PoolError> {
        let lifetime = if session.is_dead() {
            warn!("{}: pooled engine died after {:?}", session.label(), session.age());
            session.age()
        } else {
            Duration::MAX
        };
        session.kill(grace);
        if self.lock().closed {
            return Ok(());
        }
        let fresh = self.spawn_checked(lifetime).await?;
        self.hand_over(fresh);
        Ok(())
    }

    async fn replace(&self, dead: EngineSession) -> Result<EngineSession, PoolError> {
        warn!("{}: pooled engine died after {:?}, respawning", dead.label(), dead.age());
        self.spawn_checked(dead.age()).await
    }

    async fn spawn_checked(&self, lifetime: Duration) -> Result<EngineSession, PoolError> {
        if lifetime < self.inner.min_respawn {
            let elapsed_ms = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX);
            self.close();
            return Err(PoolError::CrashLoop { elapsed_ms });
        }
        match self.spawn_one().await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn hand_over(&self, mut session: EngineSession) {
        let mut st = self.lock();
        if st.closed {
            let grace = st.grace;
            drop(st);
            session.kill(grace);
            return;
        }
        while let Some(waiter) = st.waiters.pop_front() {
            match waiter.send(session) {
                Ok(()) => return,
                // 待ち手が諦めていたら次へ
                Err(back) => session = back,
            }
        }
        st.idle.push_back(session);
    }

    /// 以降の貸し出しを止め、待ち手を `Closed` で起こす。
    pub fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.waiters.clear();
    }

    /// プールを閉じ、空いているエンジンを終了させる。
    pub fn shutdown(&self, grace: Duration) {
        let idle: Vec<EngineSession> = {
            let mut st = self.lock();
            st.closed = true;
            st.grace = grace;
            st.waiters.clear();
            st.idle.drain(..).collect()
        };
        for session in idle {
            session.kill(grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSpawner;

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let spawner = ScriptedSpawner::katago_like();
        let pool = EnginePool::start(spawner.clone(), 1, Duration::ZERO).await.unwrap();
        assert_eq!(pool.idle_len(), 1);

        let held = pool.acquire().await.unwrap();
        let p1 = pool.clone();
        let first = tokio::spawn(async move { p1.acquire().await.map(|s| s.label().to_string()) });
        tokio::task::yield_now().await;
        let p2 = pool.clone();
        let second = tokio::spawn(async move {
            let s = p2.acquire().await?;
            let label = s.label().to_string();
            p2.release(s).await?;
            Ok::<_, PoolError>(label)
        });
        tokio::task::yield_now().await;
        assert_eq!(pool.waiting_len(), 2);

        let label = held.label().to_string();
        pool.release(held).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), label);
        // 1人目は返却していないので2人目はまだ待っている
        assert_eq!(pool.waiting_len(), 1);
        pool.close();
        assert_eq!(second.await.unwrap(), Err(PoolError::Closed));
    }

    #[tokio::test]
    async fn dead_engine_is_replaced() {
        let spawner = ScriptedSpawner::katago_like();
        let pool = EnginePool::start(spawner.clone(), 1, Duration::ZERO).await.unwrap();
        let session = pool.acquire().await.unwrap();
        session.kill(Duration::ZERO);
        pool.release(session).await.unwrap();
        assert_eq!(spawner.spawned(), 2);
        let fresh = pool.acquire().await.unwrap();
        assert!(!fresh.is_dead());
    }

    #[tokio::test]
    async fn crash_loop_closes_the_pool() {
        let spawner = ScriptedSpawner::katago_like();
        let pool = EnginePool::start(spawner.clone(), 1, Duration::from_secs(3600)).await.unwrap();
        let session = pool.acquire().await.unwrap();
        session.kill(Duration::ZERO);
        assert!(matches!(pool.release(session).await, Err(PoolError::CrashLoop { .. })));
        assert_eq!(spawner.spawned(), 1);
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
    }

    #[tokio::test]
    async fn engine_that_died_while_idle_is_not_lent() {
        let spawner = ScriptedSpawner::katago_like();
        let pool = EnginePool::start(spawner.clone(), 1, Duration::ZERO).await.unwrap();
        let session = pool.acquire().await.unwrap();
        let handle = session.clone();
        pool.release(session).await.unwrap();
        handle.kill(Duration::ZERO);

        let fresh = pool.acquire().await.unwrap();
        assert!(!fresh.is_dead());
        assert_ne!(fresh.label(), handle.label());
        assert_eq!(spawner.spawned(), 2);
    }

    #[tokio::test]
    async fn idle_engine_dying_at_once_is_a_crash_loop() {
        let spawner = ScriptedSpawner::katago_like();
        let pool = EnginePool::start(spawner.clone(), 1, Duration::from_secs(3600)).await.unwrap();
        let session = pool.acquire().await.unwrap();
        let handle = session.clone();
        pool.release(session).await.unwrap();
        handle.kill(Duration::ZERO);

        assert!(matches!(pool.acquire().await, Err(PoolError::CrashLoop { .. })));
        assert_eq!(spawner.spawned(), 1);
    }

    #[tokio::test]
    async fn discarding_an_engine_that_crashed_checks_for_a_crash_loop() {
        let spawner = ScriptedSpawner::new(
            Arc::new(|cmd: &str| {
                if cmd.starts_with("genmove") {
                    None
                } else {
                    crate::testing::katago_reply(cmd)
                }
            }),
            None,
        );
        let pool = EnginePool::start(spawner.clone(), 1, Duration::from_secs(3600)).await.unwrap();
        let session = pool.acquire().await.unwrap();
        assert!(session.command("genmove black").await.is_err());
        assert!(session.is_dead());

        let discarded = pool.discard(session, Duration::ZERO).await;
        assert!(matches!(discarded, Err(PoolError::CrashLoop { .. })), "{discarded:?}");
        assert_eq!(spawner.spawned(), 1);
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
    }

    #[tokio::test]
    async fn discarding_a_live_engine_always_respawns() {
        let spawner = ScriptedSpawner::katago_like();
        let pool = EnginePool::start(spawner.clone(), 1, Duration::from_secs(3600)).await.unwrap();
        let session = pool.acquire().await.unwrap();
        pool.discard(session, Duration::ZERO).await.unwrap();
        assert_eq!(spawner.spawned(), 2);
        assert_eq!(pool.idle_len(), 1);
    }
}
