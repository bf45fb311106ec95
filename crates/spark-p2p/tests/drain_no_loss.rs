//! 优雅关闭不丢消息：随机化线程数、在途深度、消息数、急切阈值与单轮匹配预算，
//! 关闭结束后每条发出的消息都恰好被一个接收通道观察到一次，且没有任何请求残留。

mod common;

use proptest::prelude::*;
use spark_p2p::{BackendKind, ContextConfig, WorkerMode};
use spark_p2p_fabric::{Fabric, FabricConfig};

use common::{Traffic, run_ranks, run_traffic};

fn backend_kind() -> impl Strategy<Value = BackendKind> {
    prop_oneof![Just(BackendKind::MessagePassing), Just(BackendKind::RdmaTag)]
}

fn worker_mode() -> impl Strategy<Value = WorkerMode> {
    prop_oneof![Just(WorkerMode::Shared), Just(WorkerMode::PerThread)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn drain_delivers_every_message_exactly_once(
        kind in backend_kind(),
        worker_mode in worker_mode(),
        size in 2u32..=3,
        threads in 1usize..=3,
        messages in 1u64..=40,
        inflight in 1usize..=3,
        len in 9usize..=48,
        eager_threshold in 0usize..=48,
        match_budget in 0usize..=3,
    ) {
        let fabric = Fabric::new(FabricConfig {
            eager_threshold,
            match_budget,
            ..FabricConfig::default()
        });
        let factory = fabric.factory(kind);
        let config = ContextConfig::default().with_worker_mode(worker_mode);
        let traffic = Traffic { threads, messages, inflight, len };
        let peers = u64::from(size - 1);

        let ranks = run_ranks(size, |domain| {
            run_traffic(domain, &factory, config.clone(), traffic)
        });

        for (rank, tally) in ranks.into_iter().enumerate() {
            let tally = tally.map_err(|err| TestCaseError::fail(format!("rank {rank}: {err}")))?;
            prop_assert_eq!(tally.outstanding, 0);
            for thread in tally.threads {
                prop_assert_eq!(thread.sent, messages * peers);
                prop_assert_eq!(thread.received, messages * peers, "rank {} 线程 {} 丢失或重复了消息", rank, thread.token);
                prop_assert_eq!(thread.foreign, 0);
                prop_assert_eq!(thread.reordered, 0);
                prop_assert_eq!(thread.report.cancelled as u64, peers * inflight as u64);
            }
        }
        prop_assert_eq!(fabric.live_engines(), 0);
    }
}
