//! 非超越匹配：同一 `(源 rank, 标签)` 上的消息按发送顺序交付，与单轮匹配预算无关。

use proptest::prelude::*;
use spark_p2p_fabric::{Fabric, FabricConfig, LocalBootstrap};
use spark_p2p_transport::{
    BackendFactory, BackendKind, BackendRequest, InitRequest, MessageBuffer, PostOutcome,
    RequestStatus, ThreadMode, WireMask, WireTag,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn same_tag_messages_never_overtake(
        tags in proptest::collection::vec(0u32..4, 1..40),
        match_budget in 0usize..=3,
        eager_threshold in prop_oneof![Just(0usize), Just(1024usize)],
    ) {
        let fabric = Fabric::new(FabricConfig {
            eager_threshold,
            match_budget,
            ..FabricConfig::default()
        });
        let domains = LocalBootstrap::world(1).expect("创建域");
        let backend = fabric
            .factory(BackendKind::MessagePassing)
            .init(
                &domains[0],
                &InitRequest {
                    thread_count: 1,
                    worker_count: 1,
                    thread_mode: ThreadMode::Single,
                    estimated_peers: 1,
                },
            )
            .expect("初始化成功");
        let worker = backend.create_worker(ThreadMode::Single).expect("创建 worker");
        let endpoint = worker.connect(0, &worker.address()).expect("自连接成功");

        // 先按随机标签序列发送，序号写入载荷首字节
        let mut sends = Vec::new();
        for (seq, &tag) in tags.iter().enumerate() {
            let outcome = worker
                .post_send(endpoint.as_ref(), MessageBuffer::from(vec![seq as u8]), WireTag::new(tag, 0))
                .expect("投递发送");
            if let PostOutcome::Pending(request) = outcome {
                sends.push(request);
            }
        }

        // 再为每条消息投递一个同标签的接收，投递顺序与发送顺序无关
        let mut recvs: Vec<(u32, Box<dyn BackendRequest>)> = Vec::new();
        for tag in (0u32..4).rev() {
            for _ in tags.iter().filter(|&&sent| sent == tag) {
                let request = worker
                    .post_recv(MessageBuffer::zeroed(1), WireTag::new(tag, 0), WireMask::EXACT)
                    .expect("投递接收");
                recvs.push((tag, request));
            }
        }

        let mut rounds = 0;
        while recvs.iter_mut().any(|(_, request)| request.test() == RequestStatus::Pending)
            || sends.iter_mut().any(|request| request.test() == RequestStatus::Pending)
        {
            worker.progress();
            rounds += 1;
            prop_assert!(rounds <= tags.len() * 2 + 2, "匹配应在有限轮内完成");
        }

        for tag in 0u32..4 {
            let delivered: Vec<u8> = recvs
                .iter_mut()
                .filter(|(posted, _)| *posted == tag)
                .map(|(_, request)| request.take_buffer().map_or(u8::MAX, |buffer| buffer[0]))
                .collect();
            let expected: Vec<u8> = tags
                .iter()
                .enumerate()
                .filter(|&(_, &sent)| sent == tag)
                .map(|(seq, _)| seq as u8)
                .collect();
            prop_assert_eq!(delivered, expected, "标签 {} 上的消息发生了超越", tag);
        }
    }
}
