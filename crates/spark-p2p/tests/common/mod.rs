//! 集成测试共用的多 rank 启动与日志初始化。
//!
//! 每个 rank 以一个 OS 线程运行在同一张进程内模拟网络上；rank 内部如需多线程，再由测试自行展开。

#![allow(dead_code)]

use std::collections::HashMap;
use std::thread;

use spark_p2p::{
    CommError, Context, ContextConfig, Domain, Drain, DrainReport, Future, MessageBuffer, Rank,
    RecvChannel, Tag,
};
use spark_p2p_fabric::LocalBootstrap;
use spark_p2p_transport::BackendFactory;
use tracing_subscriber::EnvFilter;

/// 安装测试日志输出（幂等）；级别由 `RUST_LOG` 控制，默认只输出警告。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// 为 `size` 个 rank 各启动一个线程执行 `body`，按 rank 顺序返回结果。
pub fn run_ranks<R, F>(size: u32, body: F) -> Vec<R>
where
    R: Send,
    F: Fn(Domain) -> R + Sync,
{
    init_tracing();
    let domains = LocalBootstrap::world(size).expect("本地域创建成功");
    let body = &body;
    thread::scope(|scope| {
        let handles: Vec<_> = domains
            .into_iter()
            .map(|domain| scope.spawn(move || body(domain)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank 线程不应 panic"))
            .collect()
    })
}

/// 载荷前 8 字节编码序号，其余字节填充 `fill`；长度不足 9 字节时补齐到 9。
pub fn sequenced(seq: u64, len: usize, fill: u8) -> MessageBuffer {
    let mut raw = vec![fill; len.max(9)];
    raw[..8].copy_from_slice(&seq.to_le_bytes());
    MessageBuffer::from(raw)
}

/// 读取 [`sequenced`] 写入的序号。
pub fn sequence_of(payload: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[..8]);
    u64::from_le_bytes(raw)
}

/// 一次多线程对打的参数。
#[derive(Clone, Copy, Debug)]
pub struct Traffic {
    /// 每个 rank 的线程数。
    pub threads: usize,
    /// 每个线程向每个对端发送的消息数。
    pub messages: u64,
    /// 每个 `(线程, 对端)` 的在途深度，即占用的标签数。
    pub inflight: usize,
    /// 消息长度，至少 9 字节（序号 + 发送线程号）。
    pub len: usize,
}

/// 单个线程的收发统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadTally {
    pub token: usize,
    pub sent: u64,
    pub received: u64,
    /// 标签或载荷不属于本线程的消息数。
    pub foreign: u64,
    /// 同一 `(来源, 标签)` 上序号不连续的次数。
    pub reordered: u64,
    pub report: DrainReport,
}

/// 单个 rank 的结果。
#[derive(Debug)]
pub struct RankTally {
    pub threads: Vec<ThreadTally>,
    pub outstanding: usize,
}

/// 在一个 rank 上跑完“稳态对打 + 优雅关闭”，每个线程向所有其他 rank 发送 `traffic.messages` 条消息。
///
/// 线程 `t` 使用标签 `t * inflight + slot`，因此任意两个线程的在途操作都不会共享 `(标签, 源 rank)`。
pub fn run_traffic(
    domain: Domain,
    factory: &dyn BackendFactory,
    config: ContextConfig,
    traffic: Traffic,
) -> Result<RankTally, CommError> {
    let context = Context::create_with_config(&domain, traffic.threads, factory, config)?;
    let rank = context.rank();
    let peers: Vec<Rank> = (0..context.size()).filter(|&peer| peer != rank).collect();
    let drain = Drain::new(&context, peers.iter().copied())?;

    let threads = thread::scope(|scope| {
        let handles: Vec<_> = (0..traffic.threads)
            .map(|_| scope.spawn(|| thread_traffic(&context, &drain, &peers, traffic)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("工作线程不应 panic"))
            .collect::<Result<Vec<_>, _>>()
    })?;
    Ok(RankTally {
        threads,
        outstanding: context.outstanding_requests(),
    })
}

struct SendSlot<'ctx> {
    peer: Rank,
    tag: Tag,
    next: u64,
    future: Future<'ctx>,
}

fn thread_traffic(
    context: &Context,
    drain: &Drain,
    peers: &[Rank],
    traffic: Traffic,
) -> Result<ThreadTally, CommError> {
    let token = context.get_token()?;
    let mut comm = context.get_communicator(&token);
    let me = token.id();
    let stride = traffic.inflight as u64;
    let tag_base = (me * traffic.inflight) as Tag;

    let mut channels = Vec::new();
    let mut slots = Vec::new();
    for &peer in peers {
        for slot in 0..traffic.inflight {
            let tag = tag_base + slot as Tag;
            channels.push(RecvChannel::open(
                &comm,
                MessageBuffer::zeroed(traffic.len),
                peer,
                tag,
            )?);
            slots.push(SendSlot {
                peer,
                tag,
                next: slot as u64,
                future: Future::ready(),
            });
        }
    }

    let mut tally = ThreadTally {
        token: me,
        ..ThreadTally::default()
    };
    let mut expected: HashMap<(Rank, Tag), u64> = HashMap::new();
    let mut observe = |src: Rank, tag: Tag, payload: &[u8]| {
        tally.received += 1;
        if tag as usize / traffic.inflight != me || payload.get(8) != Some(&(me as u8)) {
            tally.foreign += 1;
        }
        let next = expected
            .entry((src, tag))
            .or_insert(u64::from(tag % traffic.inflight as Tag));
        if sequence_of(payload) != *next {
            tally.reordered += 1;
        }
        *next = sequence_of(payload) + stride;
    };

    let mut sent = 0;
    while slots.iter().any(|slot| slot.next < traffic.messages) {
        for slot in slots.iter_mut() {
            if slot.next < traffic.messages && slot.future.test() {
                let buffer = sequenced(slot.next, traffic.len, me as u8);
                slot.future = comm.send(buffer, slot.peer, slot.tag)?;
                slot.next += stride;
                sent += 1;
            }
        }
        comm.progress();
        for channel in channels.iter_mut() {
            channel.service(&comm, &mut observe)?;
        }
    }

    let mut sends: Vec<Future<'_>> = slots.into_iter().map(|slot| slot.future).collect();
    let report = drain.run(&mut comm, &mut sends, &mut channels, &mut observe)?;
    tally.sent = sent;
    tally.report = report;
    Ok(tally)
}
