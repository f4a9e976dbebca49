//! 실행 락
//!
//! 칩 단위 실행은 칩별 락을 잡고 활성 카운트를 올린다.
//! Flood-fill 은 전역 상태 락을 잡은 채 활성 카운트가 0 이 될 때까지 기다린다.
//! Flood 가 진행 중이면 새 칩 실행은 카운트를 올리지 못하고 대기한다.
//! Flood 는 칩 락을 잡지 않는다.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Condvar, Mutex, MutexGuard, RawMutex};
use tracing::debug;

use crate::cores::ChipCoord;

/// 세션 전체의 실행 락 관리자
#[derive(Debug, Default)]
pub struct ExecutionLocks {
    /// 진행 중인 칩 실행 수
    active: Mutex<usize>,
    released: Condvar,
    chip_locks: DashMap<ChipCoord, Arc<Mutex<()>>>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 칩 하나에 대한 실행 락
    ///
    /// 같은 칩의 다른 실행, 또는 진행 중인 flood 가 끝날 때까지 블록된다.
    pub fn chip_execute(&self, chip: ChipCoord) -> ChipExecuteGuard<'_> {
        let chip_lock = self
            .chip_locks
            .entry(chip)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let chip_guard = match chip_lock.try_lock_arc() {
            Some(guard) => guard,
            None => {
                debug!("칩 {:?} 실행 락 대기", chip);
                chip_lock.lock_arc()
            }
        };

        *self.active.lock() += 1;
        ChipExecuteGuard {
            locks: self,
            chip,
            _chip_guard: chip_guard,
        }
    }

    /// Flood-fill 용 전역 락
    ///
    /// 모든 칩 실행이 끝날 때까지 기다리고, 가드가 살아 있는 동안 새 칩 실행을 막는다.
    pub fn flood(&self) -> FloodGuard<'_> {
        let mut active = self.active.lock();
        while *active > 0 {
            debug!("flood 락 대기: 칩 실행 {}건 진행 중", *active);
            self.released.wait(&mut active);
        }
        FloodGuard { _active: active }
    }

    /// 진행 중인 칩 실행 수 (flood 중에는 블록된다)
    pub fn active_chip_executes(&self) -> usize {
        *self.active.lock()
    }
}

/// 칩 실행 가드; drop 시 카운트를 내리고 대기자를 깨운다
pub struct ChipExecuteGuard<'a> {
    locks: &'a ExecutionLocks,
    chip: ChipCoord,
    _chip_guard: ArcMutexGuard<RawMutex, ()>,
}

impl ChipExecuteGuard<'_> {
    pub fn chip(&self) -> ChipCoord {
        self.chip
    }
}

impl Drop for ChipExecuteGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.locks.active.lock();
        *active -= 1;
        self.locks.released.notify_all();
    }
}

/// Flood 가드
pub struct FloodGuard<'a> {
    _active: MutexGuard<'a, usize>,
}
