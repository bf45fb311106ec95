//! Future 状态机与错误分类的契约测试。
//!
//! - 退役至多一次：完成后 `test` 恒真、`cancel` 恒假，缓冲区只能取回一次；
//! - 取消能力按后端与方向区分，取消被拒是正常结果而非错误；
//! - 保留标签、越界 rank、令牌耗尽与后端初始化失败都以稳定错误码暴露。

mod common;

use spark_p2p::{
    CommError, Context, ContextConfig, Future, FutureStatus, MessageBuffer, SENTINEL_TAG,
    ThreadMode, WorkerMode,
};
use spark_p2p_fabric::{Fabric, FabricConfig, LocalBootstrap};

use common::{init_tracing, run_ranks};

fn single_rank() -> spark_p2p::Domain {
    init_tracing();
    LocalBootstrap::world(1)
        .expect("单 rank 域")
        .pop()
        .expect("域内恰有一个 rank")
}

#[test]
fn completed_future_retires_exactly_once() {
    let fabric = Fabric::default();
    let context = Context::create(&single_rank(), 1, &fabric.rdma_tag()).expect("上下文创建成功");
    let token = context.get_token().expect("令牌");
    let comm = context.get_communicator(&token);

    let mut recv = comm
        .recv(MessageBuffer::zeroed(4), 0, 9)
        .expect("接收投递成功");
    let mut send = comm
        .send(MessageBuffer::from(b"ping".to_vec()), 0, 9)
        .expect("发送投递成功");
    assert_eq!(context.outstanding_requests(), 2);

    recv.wait();
    send.wait();
    assert_eq!(recv.status(), FutureStatus::Completed);
    assert!(recv.test(), "已退役的 Future 再次 test 必须立即返回真");
    assert!(!recv.cancel(), "已退役的 Future 不可再被取消");
    assert_eq!(recv.status(), FutureStatus::Completed, "取消失败不得改变状态");

    let info = recv.completion().expect("接收完成信息");
    assert_eq!((info.wire_tag.tag(), info.wire_tag.rank()), (9, 0));
    assert!(!info.truncated);
    let buffer = recv.take_buffer().expect("首次取回缓冲区");
    assert_eq!(&buffer[..], b"ping");
    assert!(recv.take_buffer().is_none(), "缓冲区至多交还一次");
    assert_eq!(context.outstanding_requests(), 0);

    let stats = context.worker(0).expect("共享 worker").stats();
    assert_eq!((stats.sends, stats.recvs, stats.cancels), (1, 1, 0));
}

#[test]
fn empty_slot_behaves_as_retired() {
    let mut slot = Future::default();
    assert!(slot.is_ready());
    assert!(slot.test());
    assert!(!slot.cancel());
    assert!(slot.take_buffer().is_none());
    assert_eq!(slot.peer(), None);
    assert_eq!(slot.tag(), None);
}

#[test]
fn eager_send_completes_at_post_time() {
    let fabric = Fabric::default();
    let context =
        Context::create(&single_rank(), 1, &fabric.message_passing()).expect("上下文创建成功");
    let token = context.get_token().expect("令牌");
    let comm = context.get_communicator(&token);

    let mut send = comm
        .send(MessageBuffer::zeroed(16), 0, 1)
        .expect("发送投递成功");
    assert!(send.is_ready(), "不超过急切阈值的发送在提交时即完成");
    assert_eq!(context.outstanding_requests(), 0, "同步完成的发送不计入挂起请求");
    assert_eq!(send.take_buffer().map(|buffer| buffer.len()), Some(16));

    let mut recv = comm
        .recv(MessageBuffer::zeroed(16), 0, 1)
        .expect("接收投递成功");
    recv.wait();
    assert_eq!(recv.completion().map(|info| info.len), Some(16));
}

#[test]
fn cancellation_follows_backend_capability() {
    let fabric = Fabric::default();
    let context = Context::create(&single_rank(), 1, &fabric.rdma_tag()).expect("上下文创建成功");
    assert!(context.capabilities().recv);
    assert!(!context.capabilities().send);
    let token = context.get_token().expect("令牌");
    let comm = context.get_communicator(&token);

    let mut send = comm
        .send(MessageBuffer::zeroed(32), 0, 2)
        .expect("发送投递成功");
    assert!(!send.cancel(), "RDMA 标签后端不能取消发送");
    assert_eq!(send.status(), FutureStatus::Pending);

    let mut orphan = comm
        .recv(MessageBuffer::zeroed(32), 0, 3)
        .expect("接收投递成功");
    assert!(orphan.cancel(), "未匹配的接收可以取消");
    assert_eq!(orphan.status(), FutureStatus::Cancelled);
    assert!(orphan.test(), "已取消的 Future 视为已退役");
    assert!(!orphan.cancel(), "取消只能生效一次");
    assert_eq!(orphan.take_buffer().map(|buffer| buffer.len()), Some(32));

    // 不可取消的发送只能经由匹配退役
    let mut recv = comm
        .recv(MessageBuffer::zeroed(32), 0, 2)
        .expect("接收投递成功");
    recv.wait();
    send.wait();
    assert_eq!(context.outstanding_requests(), 0);
    assert_eq!(context.worker(0).expect("共享 worker").stats().cancels, 1);
}

#[test]
fn truncated_receive_still_completes() {
    let fabric = Fabric::default();
    let context = Context::create(&single_rank(), 1, &fabric.rdma_tag()).expect("上下文创建成功");
    let token = context.get_token().expect("令牌");
    let comm = context.get_communicator(&token);

    let mut recv = comm
        .recv(MessageBuffer::zeroed(4), 0, 5)
        .expect("接收投递成功");
    let mut send = comm
        .send(MessageBuffer::from(vec![7u8; 10]), 0, 5)
        .expect("发送投递成功");
    recv.wait();
    send.wait();
    let info = recv.completion().expect("完成信息");
    assert!(info.truncated, "缓冲区过小时应报告截断");
    assert_eq!(info.len, 4);
    assert_eq!(recv.take_buffer().map(|buffer| buffer.to_vec()), Some(vec![7u8; 4]));
}

#[test]
fn blocking_send_returns_the_buffer() {
    let fabric = Fabric::default();
    let context =
        Context::create(&single_rank(), 1, &fabric.message_passing()).expect("上下文创建成功");
    let token = context.get_token().expect("令牌");
    let comm = context.get_communicator(&token);
    let buffer = comm
        .blocking_send(MessageBuffer::from(vec![1u8, 2, 3]), 0, 4)
        .expect("阻塞发送成功");
    assert_eq!(&buffer[..], &[1, 2, 3]);

    let mut drain = comm
        .recv(MessageBuffer::zeroed(3), 0, 4)
        .expect("接收投递成功");
    drain.wait();
}

#[test]
fn reserved_and_out_of_range_arguments_are_rejected() {
    let fabric = Fabric::default();
    let context = Context::create(&single_rank(), 1, &fabric.rdma_tag()).expect("上下文创建成功");
    let token = context.get_token().expect("令牌");
    let comm = context.get_communicator(&token);

    for tag in [SENTINEL_TAG, SENTINEL_TAG | 7, u32::MAX] {
        let err = comm
            .send(MessageBuffer::zeroed(1), 0, tag)
            .expect_err("保留标签必须被拒绝");
        assert!(matches!(err, CommError::ReservedTag(rejected) if rejected == tag));
        assert_eq!(err.code(), "spark.p2p.reserved_tag");
        assert!(comm.recv(MessageBuffer::zeroed(1), 0, tag).is_err());
    }

    let err = comm
        .send(MessageBuffer::zeroed(1), 3, 0)
        .expect_err("越界 rank 必须被拒绝");
    assert!(matches!(err, CommError::RankOutOfRange { rank: 3, size: 1 }));
    assert_eq!(context.outstanding_requests(), 0, "被拒绝的提交不得留下挂起请求");
}

#[test]
fn tokens_are_bounded_by_declared_threads() {
    let fabric = Fabric::default();
    let context = Context::create(&single_rank(), 2, &fabric.rdma_tag()).expect("上下文创建成功");
    let context = &context;
    let first = context.get_token().expect("首个令牌");
    assert_eq!(first.id(), 0);
    assert!(matches!(
        context.get_token(),
        Err(CommError::TokenAlreadyHeld { slot: 0 })
    ));

    std::thread::scope(|scope| {
        let second = scope
            .spawn(|| context.get_token().map(|token| token.id()))
            .join()
            .expect("线程不应 panic");
        assert_eq!(second.expect("第二个令牌"), 1);

        // 第二个线程退出时已归还令牌，此处先占住两个槽位再验证耗尽
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (held_tx, held_rx) = std::sync::mpsc::channel::<()>();
        scope.spawn(move || {
            let _token = context.get_token().expect("第二个令牌");
            held_tx.send(()).expect("通知主线程");
            let _ = release_rx.recv();
        });
        held_rx.recv().expect("等待令牌被占用");
        let third = scope
            .spawn(|| context.get_token().map(|token| token.id()))
            .join()
            .expect("线程不应 panic");
        assert!(matches!(third, Err(CommError::ExhaustedTokens { declared: 2 })));
        assert_eq!(context.tokens_in_use(), 2);
        release_tx.send(()).expect("释放占用线程");
    });
}

#[test]
fn unsupported_thread_mode_fails_context_creation() {
    let fabric = Fabric::new(FabricConfig {
        max_thread_mode: ThreadMode::Serialized,
        ..FabricConfig::default()
    });
    // 消息传递式后端每个上下文只有一个引擎，两个线程需要 Multi
    let err = Context::create(&single_rank(), 2, &fabric.message_passing())
        .expect_err("后端线程模式不足时必须失败");
    assert!(matches!(err, CommError::BackendInit(_)));
    assert_eq!(err.code(), "spark.p2p.backend_init");
    assert!(err.is_fatal());

    // 同一后端在共享模式的 RDMA 变体上只需要 Serialized
    let context = Context::create_with_config(
        &single_rank(),
        2,
        &fabric.rdma_tag(),
        ContextConfig::default().with_worker_mode(WorkerMode::Shared),
    )
    .expect("Serialized 足够时应成功");
    assert_eq!(context.thread_plan().backend_mode, ThreadMode::Serialized);
}

#[test]
fn zero_threads_is_invalid() {
    let fabric = Fabric::default();
    let err = Context::create(&single_rank(), 0, &fabric.rdma_tag()).expect_err("零线程无效");
    assert_eq!(err.code(), "spark.p2p.invalid_config");
}

#[test]
fn contexts_report_their_identity() {
    let fabric = Fabric::default();
    let factory = fabric.rdma_tag();
    let identities = run_ranks(3, |domain| {
        let context = Context::create(&domain, 1, &factory).expect("上下文创建成功");
        (context.rank(), context.size())
    });
    assert_eq!(identities, vec![(0, 3), (1, 3), (2, 3)]);
}
