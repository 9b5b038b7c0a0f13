//! 转发器与 TCP 传输的端到端测试。
//!
//! # 教案级导览
//!
//! - **Why**：转发路径横跨队列、后台循环、重试、TCP 编解码与接收端，单元测试无法覆盖它们的拼接处；
//! - **How**：一组用例以记录型传输验证顺序与来源标识，另一组在回环地址上启动真实的
//!   `ReplicaListener`，让 `ReplicaForwarder::connect` 与之对接；
//! - **What**：交付顺序、`source_node_id`、惰性建连、接收端延迟启动后的重试恢复、协议违规不回队列。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_registry::{
    Attributes, ForwarderConfig, NodeMap, NodeState, NodeUpdate, ReplicaForwarder,
    ReplicaListener, ReplicaTransport, Result, RetryPolicy, StateMap, UpdateRequest,
};

#[derive(Clone, Default)]
struct Recording {
    requests: Arc<Mutex<Vec<UpdateRequest>>>,
}

#[async_trait]
impl ReplicaTransport for Recording {
    async fn update(&self, request: &UpdateRequest) -> Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

fn attrs(id: &str) -> Attributes {
    Attributes {
        id: id.to_owned(),
        service: "counter".to_owned(),
        locality: "us-east-1a".to_owned(),
        revision: "v2".to_owned(),
    }
}

fn state(key: &str, value: &str) -> StateMap {
    StateMap::from([(key.to_owned(), value.to_owned())])
}

fn replica_map(id: &str) -> NodeMap {
    NodeMap::new(NodeState::from_attributes(&attrs(id), &StateMap::new(), 1))
}

/// 轮询直到条件成立，最多等待五秒。
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn updates_are_delivered_in_order_with_source_id() {
    let transport = Recording::default();
    let forwarder = ReplicaForwarder::with_transport(
        "replica-2",
        "replica-1",
        transport.clone(),
        ForwarderConfig::default(),
    )
    .expect("构造必须成功");

    let updates = vec![
        NodeUpdate::join(attrs("node-a"), StateMap::new()),
        NodeUpdate::update("node-a", state("seq", "1")),
        NodeUpdate::update("node-a", state("seq", "2")),
        NodeUpdate::leave("node-a"),
    ];
    for update in &updates {
        forwarder.update(update.clone());
    }
    forwarder.shutdown(Duration::from_secs(5)).await;

    let requests = transport.requests.lock();
    let delivered: Vec<_> = requests.iter().map(|request| request.member.clone()).collect();
    assert_eq!(delivered, updates, "单个对端上的投递顺序必须与入队顺序一致");
    assert!(
        requests
            .iter()
            .all(|request| request.source_node_id == "replica-1")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwarded_updates_reach_remote_replica_over_tcp() {
    let remote = replica_map("replica-2");
    let listener = ReplicaListener::bind("127.0.0.1:0", remote.clone())
        .await
        .expect("绑定回环地址必须成功");

    let forwarder = ReplicaForwarder::connect(
        listener.local_addr().to_string(),
        "replica-1",
        ForwarderConfig::default(),
    )
    .expect("构造必须成功");
    forwarder.update(NodeUpdate::join(attrs("node-a"), state("addr.rpc", "10.0.0.1:9000")));
    forwarder.update(NodeUpdate::update("node-a", state("status", "ready")));

    let converged = eventually(|| {
        remote
            .node("node-a")
            .is_some_and(|node| node.state.get("status").map(String::as_str) == Some("ready"))
    })
    .await;
    assert!(converged, "远端副本必须收到 JOIN 与 UPDATE");
    let node = remote.node("node-a").expect("节点必须存在");
    assert_eq!(node.state.get("addr.rpc").map(String::as_str), Some("10.0.0.1:9000"));
    assert_eq!(node.service, "counter");

    forwarder.update(NodeUpdate::leave("node-a"));
    assert!(eventually(|| remote.node("node-a").is_none()).await);

    forwarder.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_update_is_not_requeued_and_later_updates_flow() {
    let remote = replica_map("replica-2");
    let listener = ReplicaListener::bind("127.0.0.1:0", remote.clone())
        .await
        .expect("绑定回环地址必须成功");
    let forwarder = ReplicaForwarder::connect(
        listener.local_addr().to_string(),
        "replica-1",
        ForwarderConfig::default(),
    )
    .expect("构造必须成功");

    // 远端从未见过 ghost 的 JOIN，这条 UPDATE 会以 invalid_argument 被拒绝。
    forwarder.update(NodeUpdate::update("ghost", state("a", "1")));
    forwarder.update(NodeUpdate::join(attrs("node-b"), StateMap::new()));

    assert!(eventually(|| remote.node("node-b").is_some()).await);
    assert!(remote.node("ghost").is_none());
    assert_eq!(forwarder.pending(), 0);

    forwarder.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwarder_recovers_when_listener_starts_late() {
    // 先占用一个端口拿到地址，再释放，让转发器面对一个暂时不可达的对端。
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("探测端口");
        probe.local_addr().expect("探测地址")
    };

    let forwarder = ReplicaForwarder::connect(
        addr.to_string(),
        "replica-1",
        ForwarderConfig::default()
            .with_update_timeout(Duration::from_secs(10))
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(50)
                    .with_backoff(Duration::from_millis(20), Duration::from_millis(100), 2.0),
            ),
    )
    .expect("对端不可达不影响构造");
    forwarder.update(NodeUpdate::join(attrs("node-late"), StateMap::new()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let remote = replica_map("replica-2");
    let listener = ReplicaListener::bind(&addr.to_string(), remote.clone())
        .await
        .expect("原端口重新绑定");

    assert!(
        eventually(|| remote.node("node-late").is_some()).await,
        "重试必须在接收端上线后完成投递"
    );

    forwarder.close().await;
    listener.close().await;
}

#[tokio::test]
async fn construction_with_malformed_address_fails_without_task() {
    let err = ReplicaForwarder::connect("missing-port", "replica-1", ForwarderConfig::default())
        .expect_err("地址缺少端口必须被拒绝");
    assert_eq!(err.code(), "spark.registry.invalid_address");
}
