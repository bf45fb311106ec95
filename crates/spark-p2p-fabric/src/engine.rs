//! # engine 模块说明
//!
//! ## 角色定位（Why）
//! - 引擎是模拟网络中唯一会“动”的部件：它持有匹配队列，只在 `progress` 被调用时把未预期消息
//!   与已提交接收配对，并把会合协议发送的完成通知投递回发送方引擎；
//! - 两种后端共享本引擎，差异仅在于发送协议（eager 或会合）与发送是否可取消。
//!
//! ## 行为契约（What）
//! - 未预期消息按到达顺序排队，已提交接收按提交顺序排队；每个接收匹配最早一条满足
//!   `(msg & mask) == (recv & mask)` 的消息，保证同一 (来源, 标签) 上不超车；
//! - 接收缓冲区小于消息时只写入前缀并置 `truncated`；
//! - 单轮 `progress` 最多完成 `match_budget` 次匹配（`0` 表示不限）。
//!
//! ## 风险提示（Trade-offs）
//! - 匹配为 O(已提交 × 未预期) 的线性扫描，足以支撑测试规模，不适合海量在途消息；
//! - 在 `Single`/`Serialized` 模式下并发进入引擎会触发调试断言，用于暴露上层的串行化缺陷。

use core::any::Any;
use std::collections::VecDeque;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use spark_p2p_transport::{
    BackendEndpoint, BackendKind, BackendRequest, BackendWorker, CompletionInfo, MessageBuffer,
    PostOutcome, Rank, RequestStatus, ThreadMode, TransportError, WireMask, WireTag, WorkerAddress,
};
use tracing::{debug, trace};

use crate::config::FabricConfig;

/// 进程内网络：所有引擎的注册表。
pub(crate) struct Network {
    pub(crate) config: FabricConfig,
    engines: DashMap<u64, Weak<Engine>>,
    next_id: AtomicU64,
}

impl Network {
    pub(crate) fn new(config: FabricConfig) -> Self {
        Self {
            config,
            engines: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn live_engines(&self) -> usize {
        self.engines.len()
    }

    fn lookup(&self, id: u64) -> Option<Weak<Engine>> {
        self.engines.get(&id).map(|entry| entry.value().clone())
    }
}

const ADDRESS_LEN: usize = 9;

fn kind_byte(kind: BackendKind) -> u8 {
    match kind {
        BackendKind::MessagePassing => 1,
        BackendKind::RdmaTag => 2,
    }
}

fn decode_address(address: &WorkerAddress) -> Option<(u8, u64)> {
    let raw = address.as_bytes();
    if raw.len() != ADDRESS_LEN {
        return None;
    }
    let id = u64::from_le_bytes(raw[1..].try_into().ok()?);
    Some((raw[0], id))
}

/// 单个挂起操作的共享状态，被请求句柄与匹配队列同时引用。
pub(crate) struct RequestCell {
    tag: WireTag,
    mask: WireMask,
    state: Mutex<CellState>,
}

struct CellState {
    status: RequestStatus,
    buffer: Option<MessageBuffer>,
}

impl RequestCell {
    fn new(tag: WireTag, mask: WireMask, buffer: MessageBuffer) -> Arc<Self> {
        Arc::new(Self {
            tag,
            mask,
            state: Mutex::new(CellState {
                status: RequestStatus::Pending,
                buffer: Some(buffer),
            }),
        })
    }

    fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    fn deliver(&self, sender_tag: WireTag, payload: &[u8]) {
        let mut state = self.state.lock();
        let len = state
            .buffer
            .as_mut()
            .map_or(0, |buffer| buffer.fill_prefix(payload));
        state.status = RequestStatus::Completed(CompletionInfo {
            wire_tag: sender_tag,
            len,
            truncated: len < payload.len(),
        });
    }

    fn complete_send(&self) {
        let mut state = self.state.lock();
        let len = state.buffer.as_ref().map_or(0, MessageBuffer::len);
        state.status = RequestStatus::Completed(CompletionInfo {
            wire_tag: self.tag,
            len,
            truncated: false,
        });
    }

    fn mark_cancelled(&self) {
        self.state.lock().status = RequestStatus::Cancelled;
    }

    fn take_buffer(&self) -> Option<MessageBuffer> {
        let mut state = self.state.lock();
        match state.status {
            RequestStatus::Pending => None,
            _ => state.buffer.take(),
        }
    }
}

/// 线路上的一条消息。
struct Envelope {
    tag: WireTag,
    payload: Bytes,
    origin: Option<Origin>,
}

/// 会合协议发送的回执地址。
struct Origin {
    cell: Arc<RequestCell>,
    engine: Weak<Engine>,
}

#[derive(Default)]
struct MatchQueues {
    posted: VecDeque<Arc<RequestCell>>,
    unexpected: VecDeque<Envelope>,
}

/// 进度引擎。
pub(crate) struct Engine {
    id: u64,
    rank: Rank,
    kind: BackendKind,
    mode: ThreadMode,
    match_budget: usize,
    network: Arc<Network>,
    queues: Mutex<MatchQueues>,
    completions: Mutex<Vec<Arc<RequestCell>>>,
    active: AtomicUsize,
}

impl Engine {
    /// 创建引擎并注册到网络。
    pub(crate) fn spawn(
        network: &Arc<Network>,
        rank: Rank,
        kind: BackendKind,
        mode: ThreadMode,
    ) -> Arc<Engine> {
        let id = network.next_id.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::new(Engine {
            id,
            rank,
            kind,
            mode,
            match_budget: network.config.match_budget,
            network: Arc::clone(network),
            queues: Mutex::new(MatchQueues::default()),
            completions: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
        });
        network.engines.insert(id, Arc::downgrade(&engine));
        debug!(engine = id, rank, kind = %kind, mode = %mode, "fabric engine spawned");
        engine
    }

    fn address(&self) -> WorkerAddress {
        let mut raw = Vec::with_capacity(ADDRESS_LEN);
        raw.push(kind_byte(self.kind));
        raw.extend_from_slice(&self.id.to_le_bytes());
        WorkerAddress::new(raw)
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            self.mode == ThreadMode::Multi || previous == 0,
            "engine {} entered concurrently under thread mode {}",
            self.id,
            self.mode
        );
        ActiveGuard(&self.active)
    }

    fn accept(&self, envelope: Envelope) {
        self.queues.lock().unexpected.push_back(envelope);
    }

    fn cancel_recv(&self, cell: &Arc<RequestCell>) -> bool {
        let mut queues = self.queues.lock();
        match queues.posted.iter().position(|posted| Arc::ptr_eq(posted, cell)) {
            Some(index) => {
                queues.posted.remove(index);
                cell.mark_cancelled();
                true
            }
            None => false,
        }
    }

    /// 撤回仍躺在本引擎未预期队列中的会合发送。
    fn withdraw_send(&self, cell: &Arc<RequestCell>) -> bool {
        let mut queues = self.queues.lock();
        let index = queues.unexpected.iter().position(|envelope| {
            envelope
                .origin
                .as_ref()
                .is_some_and(|origin| Arc::ptr_eq(&origin.cell, cell))
        });
        match index {
            Some(index) => {
                queues.unexpected.remove(index);
                cell.mark_cancelled();
                true
            }
            None => false,
        }
    }

    fn progress(&self) -> usize {
        let _active = self.enter();

        let finished = std::mem::take(&mut *self.completions.lock());
        let mut events = finished.len();
        for cell in finished {
            cell.complete_send();
        }

        let budget = match self.match_budget {
            0 => usize::MAX,
            budget => budget,
        };
        let mut matched = Vec::new();
        {
            let mut queues = self.queues.lock();
            let mut index = 0;
            while index < queues.posted.len() && matched.len() < budget {
                let (tag, mask) = (queues.posted[index].tag, queues.posted[index].mask);
                let Some(position) = queues
                    .unexpected
                    .iter()
                    .position(|envelope| envelope.tag.matches(tag, mask))
                else {
                    index += 1;
                    continue;
                };
                let (Some(envelope), Some(recv)) = (
                    queues.unexpected.remove(position),
                    queues.posted.remove(index),
                ) else {
                    break;
                };
                matched.push((recv, envelope));
            }
        }

        events += matched.len();
        for (recv, envelope) in matched {
            trace!(
                engine = self.id,
                rank = self.rank,
                tag = envelope.tag.tag(),
                source = envelope.tag.rank(),
                len = envelope.payload.len(),
                "message matched"
            );
            recv.deliver(envelope.tag, &envelope.payload);
            if let Some(origin) = envelope.origin {
                match origin.engine.upgrade() {
                    Some(sender) => sender.completions.lock().push(origin.cell),
                    None => origin.cell.complete_send(),
                }
            }
        }
        events
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.network.engines.remove(&self.id);
        debug!(engine = self.id, rank = self.rank, "fabric engine released");
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 发送协议。
#[derive(Clone, Copy, Debug)]
pub(crate) enum SendProtocol {
    /// 不超过阈值的消息在提交时完成，其余走会合。
    Eager { threshold: usize },
    /// 一律等待接收方匹配。
    Rendezvous,
}

/// 指向对端引擎的端点。
pub(crate) struct FabricEndpoint {
    peer: Rank,
    target: Arc<Engine>,
}

impl BackendEndpoint for FabricEndpoint {
    fn peer(&self) -> Rank {
        self.peer
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum Direction {
    Recv { owner: Arc<Engine> },
    Send { target: Arc<Engine>, cancellable: bool },
}

/// 模拟网络的请求句柄。
pub(crate) struct FabricRequest {
    cell: Arc<RequestCell>,
    direction: Direction,
}

impl BackendRequest for FabricRequest {
    fn test(&mut self) -> RequestStatus {
        self.cell.status()
    }

    fn cancel(&mut self) -> bool {
        match &self.direction {
            Direction::Recv { owner } => owner.cancel_recv(&self.cell),
            Direction::Send {
                target,
                cancellable: true,
            } => target.withdraw_send(&self.cell),
            Direction::Send { .. } => false,
        }
    }

    fn take_buffer(&mut self) -> Option<MessageBuffer> {
        self.cell.take_buffer()
    }
}

/// 引擎的 worker 视图，实现 [`BackendWorker`]。
///
/// 消息传递式后端的所有视图共享同一个引擎。
pub(crate) struct FabricWorker {
    engine: Arc<Engine>,
    protocol: SendProtocol,
    cancellable_sends: bool,
}

impl FabricWorker {
    pub(crate) fn new(engine: Arc<Engine>, protocol: SendProtocol, cancellable_sends: bool) -> Self {
        Self {
            engine,
            protocol,
            cancellable_sends,
        }
    }
}

impl BackendWorker for FabricWorker {
    fn address(&self) -> WorkerAddress {
        self.engine.address()
    }

    fn connect(
        &self,
        peer: Rank,
        address: &WorkerAddress,
    ) -> Result<Arc<dyn BackendEndpoint>, TransportError> {
        let connect_failed = |reason: &str| TransportError::ConnectFailed {
            peer,
            reason: reason.to_owned(),
        };
        let (kind, id) = decode_address(address).ok_or_else(|| connect_failed("malformed address"))?;
        if kind != kind_byte(self.engine.kind) {
            return Err(connect_failed("address belongs to a different backend"));
        }
        let target = self
            .engine
            .network
            .lookup(id)
            .ok_or_else(|| connect_failed("unknown engine"))?
            .upgrade()
            .ok_or(TransportError::Disconnected { peer })?;
        if target.rank != peer {
            return Err(connect_failed("address was published by another rank"));
        }
        debug!(
            engine = self.engine.id,
            peer,
            target = target.id,
            "fabric endpoint connected"
        );
        Ok(Arc::new(FabricEndpoint { peer, target }))
    }

    fn post_send(
        &self,
        endpoint: &dyn BackendEndpoint,
        buffer: MessageBuffer,
        tag: WireTag,
    ) -> Result<PostOutcome, TransportError> {
        let endpoint = endpoint
            .as_any()
            .downcast_ref::<FabricEndpoint>()
            .ok_or_else(|| TransportError::PostRejected {
                reason: "endpoint was not created by the fabric".to_owned(),
            })?;
        let _active = self.engine.enter();
        let payload = buffer.snapshot();

        if let SendProtocol::Eager { threshold } = self.protocol
            && buffer.len() <= threshold
        {
            endpoint.target.accept(Envelope {
                tag,
                payload,
                origin: None,
            });
            return Ok(PostOutcome::Completed(buffer));
        }

        let cell = RequestCell::new(tag, WireMask::EXACT, buffer);
        endpoint.target.accept(Envelope {
            tag,
            payload,
            origin: Some(Origin {
                cell: Arc::clone(&cell),
                engine: Arc::downgrade(&self.engine),
            }),
        });
        Ok(PostOutcome::Pending(Box::new(FabricRequest {
            cell,
            direction: Direction::Send {
                target: Arc::clone(&endpoint.target),
                cancellable: self.cancellable_sends,
            },
        })))
    }

    fn post_recv(
        &self,
        buffer: MessageBuffer,
        tag: WireTag,
        mask: WireMask,
    ) -> Result<Box<dyn BackendRequest>, TransportError> {
        let _active = self.engine.enter();
        let cell = RequestCell::new(tag, mask, buffer);
        self.engine.queues.lock().posted.push_back(Arc::clone(&cell));
        Ok(Box::new(FabricRequest {
            cell,
            direction: Direction::Recv {
                owner: Arc::clone(&self.engine),
            },
        }))
    }

    fn progress(&self) -> usize {
        self.engine.progress()
    }
}
