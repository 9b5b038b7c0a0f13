//! # ClusterMember：SDK 级门面
//!
//! ## 定位与职责（Why）
//! - 应用侧的唯一入口：注册自身、发布状态、读取成员视图、订阅变更、注销；
//! - 本身很薄：协调逻辑全部在 [`NodeMap`] 与 [`ReplicaForwarder`] 内部，
//!   门面只负责“先本地应用，再推送给每个转发器”的胶水工作。
//!
//! ## 数据流（How）
//! - `update` → 构造 UPDATE 记录 → `NodeMap` 本地应用（本地读者立即可见）→
//!   同一条记录推入每个转发器的待发送队列 → 转发器异步投递；
//! - `follow` 为每条入站更新流启动一个读取任务，把远端记录应用到本地视图，
//!   协议违规只记录日志、不中断读取。
//!
//! ## 关闭语义（What）
//! - [`ClusterMember::unregister`] 广播 LEAVE、拆除订阅、停止入站读取，
//!   并发地优雅关闭全部转发器，等待它们全部退出后返回。

use std::pin::pin;

use futures::StreamExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, Result};
use crate::forwarder::ReplicaForwarder;
use crate::node_map::{NodeMap, Subscription};
use crate::node_state::{NodeState, StateMap, now_millis};
use crate::update::{Attributes, NodeUpdate};

/// 集群中的一个本地成员。
#[derive(Debug)]
pub struct ClusterMember {
    id: String,
    node_map: NodeMap,
    forwarders: Vec<ReplicaForwarder>,
    inbound: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ClusterMember {
    /// 注册本地节点。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：以本地状态初始化 `NodeMap`，本地应用 JOIN，再把 JOIN 推给每个转发器；
    /// - **契约 (What)**：返回时本节点已出现在 [`ClusterMember::nodes`] 中；
    ///   远端是否收到 JOIN 不影响返回结果。
    pub fn register(
        attributes: Attributes,
        state: StateMap,
        forwarders: Vec<ReplicaForwarder>,
    ) -> Result<Self> {
        let local = NodeState::from_attributes(&attributes, &state, now_millis());
        let node_map = NodeMap::new(local);
        let join = NodeUpdate::join(attributes, state);
        node_map.update(&join)?;

        let member = Self {
            id: join.node_id.clone(),
            node_map,
            forwarders,
            inbound: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        };
        member.forward(&join);
        tracing::info!(
            node_id = %member.id,
            peers = member.forwarders.len(),
            "registered cluster member"
        );
        Ok(member)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_map(&self) -> &NodeMap {
        &self.node_map
    }

    pub fn nodes(&self) -> Vec<NodeState> {
        self.node_map.nodes()
    }

    pub fn forwarders(&self) -> &[ReplicaForwarder] {
        &self.forwarders
    }

    /// 设置本节点的单个状态键。
    pub fn update(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.update_state(StateMap::from([(key.into(), value.into())]))
    }

    /// 以合并补丁更新本节点状态。
    pub fn update_state(&self, patch: StateMap) -> Result<()> {
        let update = NodeUpdate::update(self.id.clone(), patch);
        self.node_map.update(&update)?;
        self.forward(&update);
        Ok(())
    }

    /// 订阅成员视图变更，语义同 [`NodeMap::subscribe`]。
    pub fn subscribe<F>(&self, rewind: bool, callback: F) -> Subscription
    where
        F: FnMut(&NodeUpdate) + Send + 'static,
    {
        self.node_map.subscribe(rewind, callback)
    }

    /// 启动一个入站读取任务，把 `updates` 中的记录逐条应用到本地视图。
    ///
    /// 必须在 Tokio 运行时内调用。流结束或成员注销时任务退出。
    pub fn follow<S>(&self, updates: S) -> Result<()>
    where
        S: futures::Stream<Item = NodeUpdate> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| RegistryError::RuntimeUnavailable)?;
        let node_map = self.node_map.clone();
        let cancel = self.cancel.child_token();
        let task = runtime.spawn(async move {
            let mut updates = pin!(updates);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = updates.next() => next,
                };
                let Some(update) = next else {
                    break;
                };
                if let Err(err) = node_map.update(&update) {
                    tracing::error!(
                        member_id = %update.node_id,
                        code = err.code(),
                        error = %err,
                        "failed to update state"
                    );
                }
            }
            tracing::debug!("inbound update stream ended");
        });
        self.inbound.lock().push(task);
        Ok(())
    }

    /// 注销本节点并关闭全部后台工作。
    ///
    /// LEAVE 的投递是尽力而为的：每个转发器最多用其 `shutdown_grace` 时长排空积压。
    pub async fn unregister(&self) {
        self.forward(&NodeUpdate::leave(self.id.clone()));
        self.node_map.close();

        self.cancel.cancel();
        let inbound: Vec<_> = self.inbound.lock().drain(..).collect();
        for task in join_all(inbound).await {
            if let Err(err) = task {
                tracing::error!(error = %err, "inbound update task panicked");
            }
        }

        join_all(
            self.forwarders
                .iter()
                .map(|forwarder| forwarder.shutdown(forwarder.shutdown_grace())),
        )
        .await;
        tracing::info!(node_id = %self.id, "unregistered cluster member");
    }

    fn forward(&self, update: &NodeUpdate) {
        for forwarder in &self.forwarders {
            forwarder.update(update.clone());
        }
    }
}

impl Drop for ClusterMember {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
