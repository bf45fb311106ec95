//! # token 模块说明
//!
//! ## 角色定位（Why）
//! - 令牌把“哪个 OS 线程在用哪个槽位”显式化：通信器、worker 选择与优雅关闭的指定线程都以令牌编号为依据；
//! - 本模块同时提供上下文内的线程屏障，最后到达的线程负责执行跨 rank 的域屏障。
//!
//! ## 行为契约（What）
//! - 令牌从最小空闲槽位分配，编号范围 `0..thread_count`；
//! - 同一线程重复申请返回 [`CommError::TokenAlreadyHeld`]，槽位耗尽返回 [`CommError::ExhaustedTokens`]；
//! - 令牌析构即归还槽位；令牌不可跨线程移动。

use std::marker::PhantomData;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use spark_p2p_transport::TransportError;
use tracing::{debug, warn};

use crate::error::CommError;

/// 槽位表。
pub(crate) struct TokenRegistry {
    slots: Mutex<Vec<Option<ThreadId>>>,
}

impl TokenRegistry {
    pub(crate) fn new(thread_count: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; thread_count]),
        }
    }

    pub(crate) fn acquire(&self) -> Result<ThreadToken<'_>, CommError> {
        let me = thread::current().id();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter().position(|holder| *holder == Some(me)) {
            return Err(CommError::TokenAlreadyHeld { slot });
        }
        let slot = slots
            .iter()
            .position(Option::is_none)
            .ok_or(CommError::ExhaustedTokens {
                declared: slots.len(),
            })?;
        slots[slot] = Some(me);
        debug!(slot, thread = ?me, "thread token issued");
        Ok(ThreadToken {
            slot,
            registry: self,
            _local: PhantomData,
        })
    }

    pub(crate) fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    fn release(&self, slot: usize) {
        if let Some(holder) = self.slots.lock().get_mut(slot) {
            *holder = None;
        }
        debug!(slot, "thread token released");
    }
}

/// 线程在上下文内的身份。
///
/// # 教案式说明
/// - **契约 (What)**：`id()` 位于 `0..thread_count`；生命周期受上下文借用约束，因此上下文不可能先于令牌释放；
/// - **风险 (Trade-offs)**：令牌为 `!Send`，只能在申请它的线程上使用。
pub struct ThreadToken<'ctx> {
    slot: usize,
    registry: &'ctx TokenRegistry,
    _local: PhantomData<*const ()>,
}

impl ThreadToken<'_> {
    /// 令牌编号。
    pub fn id(&self) -> usize {
        self.slot
    }
}

impl Drop for ThreadToken<'_> {
    fn drop(&mut self) {
        self.registry.release(self.slot);
    }
}

impl core::fmt::Debug for ThreadToken<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("ThreadToken").field(&self.slot).finish()
    }
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    /// 最近一代 `on_last` 的失败原因；下一代完成前所有等待者都已读取。
    failed: Option<TransportError>,
}

/// 可重用的本地线程屏障。
pub(crate) struct ThreadBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl ThreadBarrier {
    pub(crate) fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    /// 等待全部本地线程到达；最后到达者在释放其他线程之前执行 `on_last`。
    ///
    /// `on_last` 失败时同一代的每个线程都返回 [`CommError::Bootstrap`]，而不只是执行它的线程。
    pub(crate) fn wait(
        &self,
        on_last: impl FnOnce() -> Result<(), TransportError>,
    ) -> Result<(), CommError> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.failed = on_last().err();
            if let Some(err) = &state.failed {
                warn!(generation, code = err.code(), "domain barrier failed");
            }
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
        } else {
            while state.generation == generation {
                self.released.wait(&mut state);
            }
        }
        match &state.failed {
            Some(err) => Err(CommError::Bootstrap(err.clone())),
            None => Ok(()),
        }
    }
}
