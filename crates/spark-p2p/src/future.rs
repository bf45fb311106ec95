//! # future 模块说明
//!
//! ## 角色定位（Why）
//! - 每个收发提交都返回一个 [`Future`]：它是“轮询式完成”的唯一观察窗口，同时在挂起期间独占消息缓冲区；
//! - 这里的 Future 与 `core::future::Future` 无关，不参与任何异步运行时，只能由提交它的线程主动轮询。
//!
//! ## 状态机（What）
//! - `Pending --test()/wait()--> Completed`，`Pending --cancel()--> Cancelled`；
//! - 退役只发生一次：之后 `test`/`wait` 立即返回真，`cancel` 返回假，缓冲区经 `take_buffer` 至多交还一次；
//! - [`Future::ready`] 表示“提交时已同步完成”或一个空槽位，不关联任何后端请求。
//!
//! ## 风险提示（Trade-offs）
//! - 挂起中的 Future 被丢弃时，后端请求仍在网络上，未退役计数不会归零，上下文析构时会报告该错误；
//! - `wait` 是忙等，CPU 会一直占用直到完成。

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use spark_p2p_transport::{BackendRequest, CompletionInfo, MessageBuffer, Rank, RequestStatus, Tag};
use tracing::warn;

use crate::error::PostOp;
use crate::worker::Worker;

/// 上下文范围内的未退役请求计数。
#[derive(Debug, Default)]
pub(crate) struct Outstanding(AtomicUsize);

impl Outstanding {
    pub(crate) fn register(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn retire(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Future 的对外状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FutureStatus {
    Pending,
    Completed,
    Cancelled,
}

/// 提交时记录的操作元数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OpMeta {
    pub(crate) op: PostOp,
    pub(crate) peer: Rank,
    pub(crate) tag: Tag,
}

enum State<'w> {
    Pending {
        request: Box<dyn BackendRequest>,
        worker: &'w Worker,
    },
    Completed {
        info: Option<CompletionInfo>,
        buffer: Option<MessageBuffer>,
    },
    Cancelled {
        buffer: Option<MessageBuffer>,
    },
}

/// 单个收发操作的完成句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：把不透明的后端请求、操作元数据与缓冲区所有权绑定在一起，让调用方只面对一个状态机；
/// - **契约 (What)**：
///   - 生命周期 `'w` 绑定到创建它的 worker（进而绑定到上下文），上下文不可能先于 Future 析构；
///   - `!Send`：只能由提交它的线程测试、等待或取消；
///   - 退役至多一次，缓冲区至多交还一次；
/// - **逻辑 (How)**：`test` 先推进一次 worker 进度再读取请求状态；`wait` 循环调用 `test`，
///   每空转 `spin_yield_interval` 轮让出一次 CPU。
#[must_use = "a pending Future keeps its buffer and must be retired"]
pub struct Future<'w> {
    state: State<'w>,
    meta: Option<OpMeta>,
    _local: PhantomData<*const ()>,
}

impl<'w> Future<'w> {
    /// 已完成的空 Future，常用作在途槽位的初始值。
    pub fn ready() -> Self {
        Self {
            state: State::Completed {
                info: None,
                buffer: None,
            },
            meta: None,
            _local: PhantomData,
        }
    }

    pub(crate) fn completed(meta: OpMeta, info: CompletionInfo, buffer: MessageBuffer) -> Self {
        Self {
            state: State::Completed {
                info: Some(info),
                buffer: Some(buffer),
            },
            meta: Some(meta),
            _local: PhantomData,
        }
    }

    pub(crate) fn pending(
        worker: &'w Worker,
        meta: OpMeta,
        request: Box<dyn BackendRequest>,
    ) -> Self {
        Self {
            state: State::Pending { request, worker },
            meta: Some(meta),
            _local: PhantomData,
        }
    }

    /// 非阻塞测试：推进一次进度，已退役（完成或取消）时返回 `true`。
    pub fn test(&mut self) -> bool {
        let status = match &mut self.state {
            State::Pending { request, worker } => worker.poll(request.as_mut()),
            _ => return true,
        };
        match status {
            RequestStatus::Pending => false,
            settled => {
                self.settle(settled);
                true
            }
        }
    }

    /// 忙等直到退役。
    pub fn wait(&mut self) {
        let interval = match &self.state {
            State::Pending { worker, .. } => worker.spin_yield_interval(),
            _ => return,
        };
        let mut idle: u32 = 0;
        while !self.test() {
            idle = idle.wrapping_add(1);
            if interval != 0 && idle % interval == 0 {
                thread::yield_now();
            }
        }
    }

    /// 尝试取消，返回取消是否生效。
    ///
    /// - 已退役的 Future 返回 `false`；
    /// - 后端不支持该方向的取消或操作已被匹配时返回 `false`，Future 保持挂起，调用方应继续 `test`。
    pub fn cancel(&mut self) -> bool {
        let cancelled = match &mut self.state {
            State::Pending { request, worker } => worker.cancel(request.as_mut()),
            _ => return false,
        };
        if cancelled {
            self.settle(RequestStatus::Cancelled);
        }
        cancelled
    }

    /// 退役后取回缓冲区；挂起中或已取回时返回 `None`。
    pub fn take_buffer(&mut self) -> Option<MessageBuffer> {
        match &mut self.state {
            State::Pending { .. } => None,
            State::Completed { buffer, .. } | State::Cancelled { buffer } => buffer.take(),
        }
    }

    pub fn status(&self) -> FutureStatus {
        match self.state {
            State::Pending { .. } => FutureStatus::Pending,
            State::Completed { .. } => FutureStatus::Completed,
            State::Cancelled { .. } => FutureStatus::Cancelled,
        }
    }

    /// 是否已退役。
    pub fn is_ready(&self) -> bool {
        !matches!(self.state, State::Pending { .. })
    }

    /// 完成信息；接收操作可由此读取实际字节数与截断标志。
    pub fn completion(&self) -> Option<CompletionInfo> {
        match self.state {
            State::Completed { info, .. } => info,
            _ => None,
        }
    }

    /// 对端 rank；空 Future 返回 `None`。
    pub fn peer(&self) -> Option<Rank> {
        self.meta.map(|meta| meta.peer)
    }

    /// 逻辑标签；空 Future 返回 `None`。
    pub fn tag(&self) -> Option<Tag> {
        self.meta.map(|meta| meta.tag)
    }

    pub(crate) fn meta(&self) -> Option<OpMeta> {
        self.meta
    }

    fn settle(&mut self, status: RequestStatus) {
        let previous = std::mem::replace(
            &mut self.state,
            State::Completed {
                info: None,
                buffer: None,
            },
        );
        let (mut request, worker) = match previous {
            State::Pending { request, worker } => (request, worker),
            settled => {
                self.state = settled;
                return;
            }
        };
        let buffer = request.take_buffer();
        let op = self.meta.map(|meta| meta.op);
        self.state = match status {
            RequestStatus::Completed(info) => {
                worker.record_retired(op, false);
                State::Completed {
                    info: Some(info),
                    buffer,
                }
            }
            _ => {
                worker.record_retired(op, true);
                State::Cancelled { buffer }
            }
        };
    }
}

impl Default for Future<'_> {
    fn default() -> Self {
        Self::ready()
    }
}

impl Drop for Future<'_> {
    fn drop(&mut self) {
        if let (State::Pending { .. }, Some(meta)) = (&self.state, self.meta)
            && !thread::panicking()
        {
            warn!(
                op = %meta.op,
                peer = meta.peer,
                tag = meta.tag,
                "pending future dropped; its request stays outstanding"
            );
        }
    }
}

impl core::fmt::Debug for Future<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Future")
            .field("status", &self.status())
            .field("meta", &self.meta)
            .finish()
    }
}
