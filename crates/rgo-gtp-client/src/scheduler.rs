//! 通信対局の着手計算の順番待ちと、進行中の着手数の集計
//!
//! 通信対局は同時に1局ずつしか計算しない。計算中の局が無いときだけ、
//! 待っている局から無作為に1局選んで枠を渡す。枠は [`CorrespondenceSlot`] が
//! 持ち、捨てられた時点で解放される（中断・対局終了でも取りこぼさない）。

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::prelude::*;

use crate::protocol::GameId;

#[derive(Debug, Default)]
pub struct CorrespondenceScheduler {
    waiting: Mutex<BTreeSet<GameId>>,
    in_flight: AtomicUsize,
}

impl CorrespondenceScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn waiting(&self) -> MutexGuard<'_, BTreeSet<GameId>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 着手待ちとして登録する。既に登録済みなら何もしない。
    pub fn register(&self, game_id: GameId) {
        self.waiting().insert(game_id);
    }

    pub fn unregister(&self, game_id: GameId) {
        self.waiting().remove(&game_id);
    }

    pub fn is_waiting(&self, game_id: GameId) -> bool {
        self.waiting().contains(&game_id)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting().len()
    }

    /// 計算中の通信対局の数
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 計算中の局が無ければ、待っている局から1局を無作為に選んで枠を渡す。
    pub fn dispatch<R: Rng + ?Sized>(self: &Arc<Self>, rng: &mut R) -> Option<CorrespondenceSlot> {
        let mut waiting = self.waiting();
        if self.in_flight.load(Ordering::Acquire) != 0 {
            return None;
        }
        let candidates: Vec<GameId> = waiting.iter().copied().collect();
        let game_id = *candidates.choose(rng)?;
        waiting.remove(&game_id);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(CorrespondenceSlot {
            game_id,
            scheduler: Arc::clone(self),
        })
    }

    fn finish(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// 通信対局1局ぶんの計算枠
#[derive(Debug)]
pub struct CorrespondenceSlot {
    game_id: GameId,
    scheduler: Arc<CorrespondenceScheduler>,
}

impl CorrespondenceSlot {
    pub fn game_id(&self) -> GameId {
        self.game_id
    }

    /// 枠を返す（`drop` と同じ）
    pub fn finish(self) {}
}

impl Drop for CorrespondenceSlot {
    fn drop(&mut self) {
        self.scheduler.finish();
    }
}

/// 全対局で進行中の着手計算の数
#[derive(Debug, Default)]
pub struct MoveCounter(AtomicUsize);

impl MoveCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn begin(self: &Arc<Self>) -> MoveGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        MoveGuard(Arc::clone(self))
    }
}

/// 捨てられると [`MoveCounter`] を1減らす
#[derive(Debug)]
pub struct MoveGuard(Arc<MoveCounter>);

impl Drop for MoveGuard {
    fn drop(&mut self) {
        let _ = self
            .0
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}
