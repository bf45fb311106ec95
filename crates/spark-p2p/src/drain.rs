//! # drain 模块说明：优雅关闭协议
//!
//! ## 问题背景（Why）
//! - 有的后端只能取消接收、永远不能取消发送；但关闭时必须保证对端真正发出的每条消息都被接收或显式排空，
//!   并且任何线程都不能在对端仍可能与之匹配时退出；
//! - 直接取消全部接收会丢掉仍在路上的消息，直接等待全部接收又会因对端已停发而永远挂起。
//!
//! ## 协议步骤（How）
//! 1. **本地发送排空**：每个线程轮询自己的发送（包括通信器回调表中的发送）直到全部退役，
//!    期间持续服务（接收后重投）自己的接收通道，然后对共享计数器恰好加一；
//! 2. **本地汇合**：所有线程继续“推进 + 服务”，直到计数器等于参与线程数；
//! 3. **跨 rank 握手**：指定线程（令牌 0 或串行通信器）向每个对端投递一条哨兵发送，并投递对应的哨兵接收；
//! 4. **对端完成等待**：所有线程继续“推进 + 服务”，直到指定线程看到全部哨兵接收完成并置位共享标志；
//! 5. **冲刷与取消**：每个线程反复“推进 + 服务”直到一轮内既无事件也无完成，再取消自己的接收通道
//!    与回调表中仍挂起的接收；
//!    取消被拒（接收已被匹配、正在交付）时回到冲刷，直到全部通道关闭。
//!
//! ## 行为契约（What）
//! - 哨兵到达证明对端所有线程的发送都已退役，因此对端不会再发出任何匹配本端接收的消息；
//! - 提交时即完成的急切发送在退役时已经进入本端队列但尚未匹配，第 5 步的冲刷负责把它们交给接收通道；
//! - 协议是一次性的：一个 [`Drain`] 只能被每个参与线程运行一次。
//!
//! ## 风险提示（Trade-offs）
//! - 所有线程都必须调用 [`Drain::run`]，缺席任何一个都会让其余线程永远停在第 2 步；
//! - 指定线程在握手阶段遇到提交错误会直接返回，其余线程会停在第 4 步，此类错误本身已是致命的。

#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spark_p2p_transport::{MessageBuffer, Rank, SENTINEL_TAG, Tag};
use tracing::{debug, info, warn};

use crate::communicator::Communicator;
use crate::context::Context;
use crate::error::CommError;
use crate::future::{Future, FutureStatus};

/// 进程内跨线程可见的关闭状态：发送完成计数与对端完成标志。
///
/// # 教案式说明
/// - **契约 (What)**：`mark_sends_done` 每个参与线程恰好调用一次；`mark_peers_done` 只由指定线程调用；
/// - **逻辑 (How)**：计数器以 `AcqRel` 递增、`Acquire` 读取，标志以 `Release` 写、`Acquire` 读，
///   保证观察到标志的线程也能看到指定线程之前的全部写入。
#[derive(Debug)]
pub struct DrainGate {
    participants: usize,
    sends_done: AtomicUsize,
    peers_done: AtomicBool,
}

impl DrainGate {
    pub fn new(participants: usize) -> Self {
        Self {
            participants,
            sends_done: AtomicUsize::new(0),
            peers_done: AtomicBool::new(false),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// 记录本线程发送已全部退役，返回记录后的计数。
    pub fn mark_sends_done(&self) -> usize {
        self.sends_done.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 是否所有参与线程都已完成本地发送排空。
    pub fn all_sends_done(&self) -> bool {
        self.sends_done.load(Ordering::Acquire) >= self.participants
    }

    pub fn mark_peers_done(&self) {
        self.peers_done.store(true, Ordering::Release);
    }

    /// 指定线程是否已收到全部对端哨兵。
    pub fn peers_done(&self) -> bool {
        self.peers_done.load(Ordering::Acquire)
    }
}

/// 单个线程一次关闭的统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// 哨兵到达之前完成并重投的接收数。
    pub reposted: usize,
    /// 哨兵到达之后冲刷出的接收数。
    pub drained: usize,
    /// 成功取消的接收数，包括接收通道与回调表中的接收。
    pub cancelled: usize,
}

impl DrainReport {
    /// 关闭期间交给观察者的消息总数。
    pub fn received(&self) -> usize {
        self.reposted + self.drained
    }
}

/// 始终保持一个挂起接收的通道：每次完成后把同一缓冲区重新投递给同一 `(src, tag)`。
///
/// # 教案式说明
/// - **意图 (Why)**：稳态流量与关闭协议都需要“接收完成即重投”，把它封装起来可以避免同一 Future 被退役两次；
/// - **契约 (What)**：
///   - 通道在被取消之前始终持有一个挂起接收；
///   - `service` 在完成时先把有效载荷交给观察者，再重投，返回是否处理了一次完成；
///   - 取消成功后通道关闭，之后的 `service` 与 `cancel` 都不再有效果。
pub struct RecvChannel<'ctx> {
    future: Future<'ctx>,
    src: Rank,
    tag: Tag,
    closed: bool,
}

impl<'ctx> RecvChannel<'ctx> {
    /// 投递首个接收，打开通道。
    pub fn open(
        comm: &Communicator<'ctx>,
        buffer: MessageBuffer,
        src: Rank,
        tag: Tag,
    ) -> Result<Self, CommError> {
        let future = comm.recv(buffer, src, tag)?;
        Ok(Self {
            future,
            src,
            tag,
            closed: false,
        })
    }

    pub fn src(&self) -> Rank {
        self.src
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// 通道是否已被取消。
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 测试当前接收；完成时交给观察者并重投。
    pub fn service(
        &mut self,
        comm: &Communicator<'ctx>,
        observer: &mut impl FnMut(Rank, Tag, &[u8]),
    ) -> Result<bool, CommError> {
        if self.closed || !self.future.test() {
            return Ok(false);
        }
        if self.future.status() == FutureStatus::Cancelled {
            self.closed = true;
            return Ok(false);
        }
        let info = self.future.completion();
        let Some(buffer) = self.future.take_buffer() else {
            self.closed = true;
            return Ok(false);
        };
        let (src, tag, len) = match info {
            Some(info) => (info.wire_tag.rank(), info.wire_tag.tag(), info.len),
            None => (self.src, self.tag, buffer.len()),
        };
        observer(src, tag, &buffer[..len.min(buffer.len())]);
        self.future = comm.recv(buffer, self.src, self.tag)?;
        Ok(true)
    }

    /// 尝试取消挂起接收；成功后通道关闭。
    pub fn cancel(&mut self) -> bool {
        if self.closed || !self.future.cancel() {
            return false;
        }
        self.closed = true;
        true
    }
}

impl core::fmt::Debug for RecvChannel<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecvChannel")
            .field("src", &self.src)
            .field("tag", &self.tag)
            .field("closed", &self.closed)
            .field("future", &self.future)
            .finish()
    }
}

/// 一个上下文的优雅关闭协调者，由全部本地线程共享。
#[derive(Debug)]
pub struct Drain {
    gate: DrainGate,
    rank: Rank,
    peers: Vec<Rank>,
    cancel_recv: bool,
}

impl Drain {
    /// 为 `context` 准备关闭协议，`peers` 为本进程与之通信过的 rank。
    ///
    /// 参与线程数取上下文声明的线程数；越界的 rank 返回 [`CommError::RankOutOfRange`]。
    pub fn new(
        context: &Context,
        peers: impl IntoIterator<Item = Rank>,
    ) -> Result<Self, CommError> {
        let size = context.size();
        let mut peers = peers
            .into_iter()
            .map(|peer| {
                if peer < size {
                    Ok(peer)
                } else {
                    Err(CommError::RankOutOfRange { rank: peer, size })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        peers.sort_unstable();
        peers.dedup();
        Ok(Self {
            gate: DrainGate::new(context.thread_count()),
            rank: context.rank(),
            peers,
            cancel_recv: context.capabilities().recv,
        })
    }

    pub fn gate(&self) -> &DrainGate {
        &self.gate
    }

    pub fn peers(&self) -> &[Rank] {
        &self.peers
    }

    /// 在调用线程上运行关闭协议。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - `sends` 为本线程此前投递的全部发送（允许包含 [`Future::ready`] 空槽），返回时全部已退役；
    ///   - `recvs` 为本线程的接收通道，返回时全部已关闭（后端不支持取消接收时保持打开并记录警告）；
    ///   - 通信器回调表中的发送在第 1 步等待退役，挂起的接收在第 5 步取消，被取消的回调不会被调用；
    ///   - 关闭期间完成的每条消息都恰好交给 `observer` 一次；
    /// - **前置条件**：上下文声明的每个线程都必须以各自的通信器调用本方法。
    pub fn run<'ctx>(
        &self,
        comm: &mut Communicator<'ctx>,
        sends: &mut [Future<'ctx>],
        recvs: &mut [RecvChannel<'ctx>],
        mut observer: impl FnMut(Rank, Tag, &[u8]),
    ) -> Result<DrainReport, CommError> {
        debug_assert_eq!(comm.rank(), self.rank, "communicator belongs to another context");
        let token = comm.token();
        let designated = token.is_none_or(|token| token == 0);
        let mut report = DrainReport::default();

        while !all_retired(sends) || comm.pending_callback_sends() > 0 {
            comm.progress();
            report.reposted += service_all(comm, recvs, &mut observer)?;
        }
        let done = self.gate.mark_sends_done();
        debug!(rank = self.rank, ?token, done, "local sends retired");

        while !self.gate.all_sends_done() {
            comm.progress();
            report.reposted += service_all(comm, recvs, &mut observer)?;
        }

        if designated {
            info!(
                rank = self.rank,
                peers = self.peers.len(),
                "local sends drained; exchanging sentinels"
            );
            let mut sentinel_recvs = self
                .peers
                .iter()
                .map(|&peer| comm.recv_unchecked(MessageBuffer::zeroed(0), peer, SENTINEL_TAG))
                .collect::<Result<Vec<_>, _>>()?;
            let mut sentinel_sends = self
                .peers
                .iter()
                .map(|&peer| comm.send_unchecked(MessageBuffer::zeroed(0), peer, SENTINEL_TAG))
                .collect::<Result<Vec<_>, _>>()?;
            while !all_retired(&mut sentinel_recvs) {
                comm.progress();
                report.reposted += service_all(comm, recvs, &mut observer)?;
            }
            self.gate.mark_peers_done();
            info!(rank = self.rank, "peer sentinels received");
            while !all_retired(&mut sentinel_sends) {
                comm.progress();
                report.reposted += service_all(comm, recvs, &mut observer)?;
            }
        } else {
            while !self.gate.peers_done() {
                comm.progress();
                report.reposted += service_all(comm, recvs, &mut observer)?;
            }
        }

        loop {
            loop {
                let events = comm.progress();
                let serviced = service_all(comm, recvs, &mut observer)?;
                report.drained += serviced;
                if events == 0 && serviced == 0 {
                    break;
                }
            }
            if !self.cancel_recv {
                warn!(
                    rank = self.rank,
                    ?token,
                    open = recvs.len(),
                    callbacks = comm.pending_callbacks(),
                    "backend cannot cancel receives; channels left posted"
                );
                break;
            }
            let (cancelled, mut refused) = comm.cancel_callback_recvs();
            report.cancelled += cancelled;
            for channel in recvs.iter_mut().filter(|channel| !channel.is_closed()) {
                if channel.cancel() {
                    report.cancelled += 1;
                } else {
                    refused += 1;
                }
            }
            if refused == 0 {
                break;
            }
            warn!(
                rank = self.rank,
                ?token,
                refused,
                "receive cancellation refused; draining matched receives"
            );
        }

        if designated {
            info!(rank = self.rank, ?report, "drain finished");
        } else {
            debug!(rank = self.rank, ?token, ?report, "drain finished");
        }
        Ok(report)
    }
}

fn all_retired(futures: &mut [Future<'_>]) -> bool {
    futures
        .iter_mut()
        .fold(true, |all, future| future.test() && all)
}

fn service_all<'ctx>(
    comm: &Communicator<'ctx>,
    recvs: &mut [RecvChannel<'ctx>],
    observer: &mut impl FnMut(Rank, Tag, &[u8]),
) -> Result<usize, CommError> {
    let mut serviced = 0;
    for channel in recvs.iter_mut() {
        if channel.service(comm, observer)? {
            serviced += 1;
        }
    }
    Ok(serviced)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use spark_p2p_fabric::{Fabric, LocalBootstrap};

    #[test]
    fn gate_opens_after_every_participant() {
        let gate = DrainGate::new(2);
        assert!(!gate.all_sends_done());
        assert_eq!(gate.mark_sends_done(), 1);
        assert!(!gate.all_sends_done(), "仅一个线程完成时不得放行");
        assert_eq!(gate.mark_sends_done(), 2);
        assert!(gate.all_sends_done());
        assert!(!gate.peers_done());
        gate.mark_peers_done();
        assert!(gate.peers_done());
    }

    #[test]
    fn single_rank_drain_flushes_self_traffic() {
        let fabric = Fabric::default();
        let domains = LocalBootstrap::world(1).expect("单 rank 域");
        let context =
            Context::create(&domains[0], 1, &fabric.rdma_tag()).expect("上下文创建成功");
        let token = context.get_token().expect("令牌");
        let mut comm = context.get_communicator(&token);

        let mut channels = vec![RecvChannel::open(&comm, MessageBuffer::zeroed(8), 0, 3)
            .expect("通道打开")];
        let mut sends = (0..3u8)
            .map(|seq| comm.send(MessageBuffer::from(vec![seq; 8]), 0, 3))
            .collect::<Result<Vec<_>, _>>()
            .expect("发送投递");

        let drain = Drain::new(&context, [0]).expect("关闭协调者");
        let mut seen = Vec::new();
        let report = drain
            .run(&mut comm, &mut sends, &mut channels, |src, tag, payload| {
                assert_eq!((src, tag), (0, 3));
                seen.push(payload[0]);
            })
            .expect("关闭成功");

        assert_eq!(seen, vec![0, 1, 2], "自发自收的消息应按顺序全部交付");
        assert_eq!(report.received(), 3);
        assert_eq!(report.cancelled, 1);
        assert!(channels[0].is_closed());
        drop(channels);
        drop(sends);
        drop(comm);
        drop(token);
        assert_eq!(context.outstanding_requests(), 0);
    }

    #[test]
    fn out_of_range_peer_is_rejected() {
        let fabric = Fabric::default();
        let domains = LocalBootstrap::world(1).expect("单 rank 域");
        let context =
            Context::create(&domains[0], 1, &fabric.message_passing()).expect("上下文创建成功");
        assert!(matches!(
            Drain::new(&context, [0, 1]),
            Err(CommError::RankOutOfRange { rank: 1, size: 1 })
        ));
    }
}
