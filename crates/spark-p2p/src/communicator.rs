//! # communicator 模块说明
//!
//! ## 角色定位（Why）
//! - 通信器是每个线程面对的唯一 API：`send`/`recv` 返回 [`Future`]，`progress` 推进引擎；
//! - 它负责线标签编解码、保留标签与 rank 越界检查，并经 worker 的端点缓存按需建连。
//!
//! ## 行为契约（What）
//! - 通信器不做内部同步：同一实例同一时刻只能被一个线程使用（类型层面为 `!Send`）；
//! - 不同令牌的通信器可以并发使用，即便它们共享同一个进度引擎；
//! - 回调变体：回调与缓冲区由通信器的回调表持有，在本线程的 `progress` 中检测到完成时恰好调用一次；
//!   提交时已同步完成的发送会立即调用其回调；
//! - 优雅关闭把回调表视为本线程操作的一部分：等待其中的发送退役，并取消其中仍挂起的接收。
//!
//! ## 风险提示（Trade-offs）
//! - 每个回调条目在 `progress` 中都会做一次 `test`，而 `test` 本身也会推进引擎；
//!   回调表很长时单次 `progress` 的开销随之线性增长。

use std::marker::PhantomData;

use spark_p2p_transport::{MessageBuffer, Rank, Tag, tag::is_reserved};
use tracing::warn;

use crate::error::{CommError, PostOp};
use crate::future::Future;
use crate::worker::Worker;

/// 完成回调：`(对端 rank, 逻辑标签, 缓冲区)`。
pub type Callback<'ctx> = Box<dyn FnOnce(Rank, Tag, MessageBuffer) + 'ctx>;

struct CallbackEntry<'ctx> {
    future: Future<'ctx>,
    callback: Callback<'ctx>,
}

impl CallbackEntry<'_> {
    fn is_send(&self) -> bool {
        self.future
            .meta()
            .is_some_and(|meta| matches!(meta.op, PostOp::Send))
    }

    fn fire(mut self) {
        let Some(meta) = self.future.meta() else {
            return;
        };
        let (peer, tag) = match (meta.op, self.future.completion()) {
            (PostOp::Recv, Some(info)) => (info.wire_tag.rank(), info.wire_tag.tag()),
            _ => (meta.peer, meta.tag),
        };
        let buffer = self
            .future
            .take_buffer()
            .unwrap_or_else(|| MessageBuffer::zeroed(0));
        (self.callback)(peer, tag, buffer);
    }
}

/// 线程私有的通信能力。
///
/// # 教案式说明
/// - **意图 (Why)**：把共享的后端状态与令牌私有状态（回调表）绑定，供单个线程独占使用；
/// - **契约 (What)**：
///   - 生命周期 `'ctx` 借用自上下文，上下文必须比通信器及其产出的 Future 活得更久；
///   - `send`/`recv` 的缓冲区在 Future 退役前归 Future 所有；
///   - 应用标签不得设置最高位（[`spark_p2p_transport::SENTINEL_TAG`] 所在区间）。
/// - **逻辑 (How)**：发送以 `(tag, 本 rank)` 编码线标签，接收以 `(tag, 期望来源)` 编码并使用全 64 位掩码。
pub struct Communicator<'ctx> {
    worker: &'ctx Worker,
    token: Option<usize>,
    callbacks: Vec<CallbackEntry<'ctx>>,
    _local: PhantomData<*const ()>,
}

impl<'ctx> Communicator<'ctx> {
    pub(crate) fn new(worker: &'ctx Worker, token: Option<usize>) -> Self {
        Self {
            worker,
            token,
            callbacks: Vec::new(),
            _local: PhantomData,
        }
    }

    /// 本进程 rank。
    pub fn rank(&self) -> Rank {
        self.worker.rank()
    }

    /// 域内进程总数。
    pub fn size(&self) -> u32 {
        self.worker.size()
    }

    /// 绑定的令牌编号；串行通信器返回 `None`。
    pub fn token(&self) -> Option<usize> {
        self.token
    }

    /// 底层 worker。
    pub fn worker(&self) -> &'ctx Worker {
        self.worker
    }

    /// 提交非阻塞发送。
    ///
    /// - 后端同步完成时返回已完成的 Future，无需再轮询；
    /// - 错误：[`CommError::ReservedTag`]、[`CommError::RankOutOfRange`]、[`CommError::Connect`]、
    ///   [`CommError::Post`]。
    pub fn send(
        &self,
        buffer: MessageBuffer,
        dst: Rank,
        tag: Tag,
    ) -> Result<Future<'ctx>, CommError> {
        check_tag(tag)?;
        self.send_unchecked(buffer, dst, tag)
    }

    /// 提交非阻塞接收，只匹配来自 `src` 且逻辑标签为 `tag` 的消息。
    pub fn recv(
        &self,
        buffer: MessageBuffer,
        src: Rank,
        tag: Tag,
    ) -> Result<Future<'ctx>, CommError> {
        check_tag(tag)?;
        self.recv_unchecked(buffer, src, tag)
    }

    /// 推进一轮进度并派发已完成的回调，返回推进的事件数。
    pub fn progress(&mut self) -> usize {
        let mut events = self.worker.progress();
        let mut index = 0;
        while index < self.callbacks.len() {
            if self.callbacks[index].future.test() {
                self.callbacks.swap_remove(index).fire();
                events += 1;
            } else {
                index += 1;
            }
        }
        events
    }

    /// 发送并忙等完成，返回缓冲区。
    pub fn blocking_send(
        &self,
        buffer: MessageBuffer,
        dst: Rank,
        tag: Tag,
    ) -> Result<MessageBuffer, CommError> {
        let mut future = self.send(buffer, dst, tag)?;
        future.wait();
        Ok(future
            .take_buffer()
            .unwrap_or_else(|| MessageBuffer::zeroed(0)))
    }

    /// 以回调方式发送；回调在完成时以 `(dst, tag, buffer)` 调用。
    pub fn send_with_callback(
        &mut self,
        buffer: MessageBuffer,
        dst: Rank,
        tag: Tag,
        callback: impl FnOnce(Rank, Tag, MessageBuffer) + 'ctx,
    ) -> Result<(), CommError> {
        let future = self.send(buffer, dst, tag)?;
        self.enqueue(future, Box::new(callback));
        Ok(())
    }

    /// 以回调方式接收；回调参数取自实际匹配到的线标签。
    pub fn recv_with_callback(
        &mut self,
        buffer: MessageBuffer,
        src: Rank,
        tag: Tag,
        callback: impl FnOnce(Rank, Tag, MessageBuffer) + 'ctx,
    ) -> Result<(), CommError> {
        let future = self.recv(buffer, src, tag)?;
        self.enqueue(future, Box::new(callback));
        Ok(())
    }

    /// 尚未派发的回调数。
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// 回调表中尚未派发的发送数。
    pub(crate) fn pending_callback_sends(&self) -> usize {
        self.callbacks.iter().filter(|entry| entry.is_send()).count()
    }

    /// 取消回调表中全部挂起的接收，返回 `(已取消, 被拒绝)`。
    ///
    /// 取消成功的条目连同回调与缓冲区一起丢弃，回调不会被调用；
    /// 被拒绝的条目（已匹配、尚未交付）留在表中，由后续 `progress` 正常派发。
    pub(crate) fn cancel_callback_recvs(&mut self) -> (usize, usize) {
        let (mut cancelled, mut refused) = (0, 0);
        self.callbacks.retain_mut(|entry| {
            if entry.is_send() {
                return true;
            }
            if entry.future.cancel() {
                cancelled += 1;
                false
            } else {
                refused += 1;
                true
            }
        });
        (cancelled, refused)
    }

    pub(crate) fn send_unchecked(
        &self,
        buffer: MessageBuffer,
        dst: Rank,
        tag: Tag,
    ) -> Result<Future<'ctx>, CommError> {
        let endpoint = self.worker.connect(dst)?;
        self.worker.post_send(&endpoint, buffer, tag)
    }

    pub(crate) fn recv_unchecked(
        &self,
        buffer: MessageBuffer,
        src: Rank,
        tag: Tag,
    ) -> Result<Future<'ctx>, CommError> {
        self.worker.connect(src)?;
        self.worker.post_recv(buffer, src, tag)
    }

    fn enqueue(&mut self, future: Future<'ctx>, callback: Callback<'ctx>) {
        let entry = CallbackEntry { future, callback };
        if entry.future.is_ready() {
            entry.fire();
        } else {
            self.callbacks.push(entry);
        }
    }
}

impl Drop for Communicator<'_> {
    fn drop(&mut self) {
        if !self.callbacks.is_empty() {
            warn!(
                rank = self.worker.rank(),
                token = ?self.token,
                pending = self.callbacks.len(),
                "communicator dropped with pending callbacks"
            );
        }
    }
}

impl core::fmt::Debug for Communicator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank())
            .field("token", &self.token)
            .field("pending_callbacks", &self.callbacks.len())
            .finish()
    }
}

fn check_tag(tag: Tag) -> Result<(), CommError> {
    if is_reserved(tag) {
        Err(CommError::ReservedTag(tag))
    } else {
        Ok(())
    }
}
