#![doc = r#"
# spark-registry

## 设计动机（Why）
- **定位**：集群成员注册表。节点加入集群后发布可变的键值状态（node state），
  每个参与者都维护一份最终一致的、覆盖全部存活节点的视图。
- **架构角色**：本 crate 聚焦两条最难的链路：
  1. 客户端聚合视图 [`NodeMap`]：把有序的 JOIN/UPDATE/LEAVE 事件流折叠为
     一致的时点视图，并向订阅者实时扇出；
  2. 副本转发管线 [`ReplicaForwarder`]：把本地更新异步推送到对端副本，
     链路不稳定甚至长期中断时既不阻塞调用方，也不会无界增长内存。
- **设计理念**：新鲜度优先于完整性。队列满时丢弃最旧更新、重试耗尽即丢弃，
  一致性最终由带外的 read repair（全量对账）兜底。

## 核心契约（What）
- [`NodeState`]：单个节点的身份与状态映射，复制即深拷贝；
- [`PendingQueue`]：有界、线程安全、丢最旧的待发送队列，是背压原语；
- [`ReplicaForwarder`]：一个对端一个实例，后台循环取队列并在超时内投递；
- [`NodeMap`]：应用更新流、维护成员映射、同步广播给订阅者；
- [`ClusterMember`]：SDK 级门面，先本地应用、再推送给全部转发器；
- [`transport`]：转发 RPC 的传输抽象、重试包装与 TCP 实现（含接收端监听器）。

## 实现策略（How）
- 共享状态一律由 `parking_lot::Mutex` 保护，锁只覆盖内存操作，
  绝不跨越网络 IO 或阻塞等待；
- 后台工作全部运行在 Tokio 任务上，以 `CancellationToken` 作为共享取消上下文，
  关闭时 join 任务，保证 `close()` 返回后不遗留后台工作；
- 日志统一走 `tracing`，错误统一收敛到 [`RegistryError`]。

## 风险与考量（Trade-offs）
- 订阅者回调在 `NodeMap` 的锁内同步执行：顺序保证简单可靠，但慢回调会拖慢写入方；
- 丢弃策略属于正确性相关的设计，不可“修复”为阻塞或无损队列。
"#]

pub mod config;
pub mod error;
pub mod forwarder;
pub mod member;
pub mod node_map;
pub mod node_state;
pub mod observability;
pub mod partition;
pub mod pending;
pub mod transport;
pub mod update;

pub use config::{ForwarderConfig, ReplicaConfig, RetryPolicy};
pub use error::{RegistryError, Result, RpcStatus};
pub use forwarder::ReplicaForwarder;
pub use member::ClusterMember;
pub use node_map::{NodeMap, Subscription};
pub use node_state::{NodeState, StateMap, copy_state};
pub use partition::{PartitionFilter, Partitioner, PartitionerBinding};
pub use pending::{PendingQueue, PushOutcome};
pub use transport::{
    ReplicaListener, ReplicaTransport, RetryingTransport, TcpReplicaTransport, UpdateRequest,
    UpdateResponse,
};
pub use update::{Attributes, NodeUpdate, UpdateType};
