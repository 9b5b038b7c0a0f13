//! # NodeMap：客户端聚合成员视图
//!
//! ## 核心意图（Why）
//! - 把有序的 JOIN/UPDATE/LEAVE 更新流折叠为 `node_id -> NodeState` 的一致时点视图；
//! - 将每次成功应用的变更实时扇出给订阅者，新订阅者可选择先回放（rewind）当前全量状态，
//!   从而无需额外的“列表”调用，也就不存在列表与订阅起点之间的竞态。
//!
//! ## 行为契约（What）
//! - JOIN：未知节点插入新状态；已知节点视为幂等刷新（属性与状态后写胜出，`created` 保留）；
//! - UPDATE：合并补丁，只修改列出的键；未知节点返回 [`RegistryError::UnknownNode`]，映射保持不变；
//!   空补丁对已知节点是无操作，不会通知订阅者；
//! - LEAVE：整体移除；未知节点为无操作，且不会通知订阅者；
//! - 每次成功变更都会在 `update` 返回之前，按应用顺序同步交付给全部当前订阅者。
//!
//! ## 扇出策略（Trade-offs）
//! - 选择“在映射锁内同步调用回调”：单一互斥量同时守护映射与订阅者集合，
//!   每个订阅者看到的顺序天然等于 `update` 的调用顺序，回放与实时更新也不会交错；
//! - 代价是慢回调会拖慢写入方。回调必须尽快返回，且 **不得** 回调同一个 `NodeMap`
//!   （包括 `update`、`nodes`、`subscribe` 与 `Subscription::unsubscribe`），否则会死锁；
//!   需要重活的订阅者应把记录转交给自己的通道或任务。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{RegistryError, Result};
use crate::node_state::{NodeState, now_millis};
use crate::update::{NodeUpdate, UpdateType};

type Callback = Box<dyn FnMut(&NodeUpdate) + Send + 'static>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

struct Inner {
    local_id: String,
    nodes: BTreeMap<String, NodeState>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    closed: bool,
}

impl Inner {
    fn broadcast(&mut self, update: &NodeUpdate) {
        for subscriber in &mut self.subscribers {
            (subscriber.callback)(update);
        }
    }
}

/// 成员视图句柄，克隆开销为一次 `Arc` 计数。
#[derive(Clone)]
pub struct NodeMap {
    inner: Arc<Mutex<Inner>>,
}

impl NodeMap {
    /// 以本地节点状态初始化视图，本节点无需任何往返即可观测到自己。
    pub fn new(local: NodeState) -> Self {
        let local_id = local.id.clone();
        let mut nodes = BTreeMap::new();
        nodes.insert(local.id.clone(), local.copy());
        Self {
            inner: Arc::new(Mutex::new(Inner {
                local_id,
                nodes,
                subscribers: Vec::new(),
                next_subscriber: 0,
                closed: false,
            })),
        }
    }

    pub fn local_id(&self) -> String {
        self.inner.lock().local_id.clone()
    }

    /// 应用一条更新记录并同步广播给订阅者。
    ///
    /// # 契约
    /// - 协议违规（UPDATE 未知节点、JOIN 缺少或错配属性）返回错误，映射与订阅者均不受影响；
    /// - 其余情况返回 `Ok(())`，且所有订阅者已在返回前收到该记录；
    ///   未知节点的 LEAVE 与已知节点的空补丁 UPDATE 是无操作，不会广播。
    pub fn update(&self, update: &NodeUpdate) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match update.update_type {
            UpdateType::Join => {
                let attributes =
                    update
                        .attributes
                        .as_ref()
                        .ok_or_else(|| RegistryError::MissingAttributes {
                            node_id: update.node_id.clone(),
                        })?;
                if attributes.id != update.node_id {
                    return Err(RegistryError::AttributesMismatch {
                        node_id: update.node_id.clone(),
                        attributes_id: attributes.id.clone(),
                    });
                }
                let created = inner
                    .nodes
                    .get(&update.node_id)
                    .map_or_else(now_millis, |existing| existing.created);
                inner.nodes.insert(
                    update.node_id.clone(),
                    NodeState::from_attributes(attributes, &update.state, created),
                );
            }
            UpdateType::Update => {
                let node = inner.nodes.get_mut(&update.node_id).ok_or_else(|| {
                    RegistryError::UnknownNode {
                        node_id: update.node_id.clone(),
                    }
                })?;
                if update.state.is_empty() {
                    return Ok(());
                }
                node.state.extend(
                    update
                        .state
                        .iter()
                        .map(|(key, value)| (key.clone(), value.clone())),
                );
            }
            UpdateType::Leave => {
                if inner.nodes.remove(&update.node_id).is_none() {
                    return Ok(());
                }
            }
        }

        inner.broadcast(update);
        Ok(())
    }

    /// 全部成员状态的快照副本，按节点 id 排序。
    pub fn nodes(&self) -> Vec<NodeState> {
        self.inner.lock().nodes.values().map(NodeState::copy).collect()
    }

    pub fn node(&self, node_id: &str) -> Option<NodeState> {
        self.inner.lock().nodes.get(node_id).map(NodeState::copy)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    /// 注册订阅者。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：`rewind = true` 时，在返回之前以合成 JOIN 的形式为每个已知节点调用一次回调；
    ///   之后回调将收到每一条成功应用的记录，直到 [`Subscription::unsubscribe`]；
    /// - **逻辑 (How)**：回放与登记在同一次加锁内完成，任何并发 `update` 要么完全在回放之前
    ///   （已体现在回放内容中），要么完全在登记之后（作为实时更新送达）；
    /// - **注意 (Trade-offs)**：视图已关闭时返回的订阅为空操作，回调永远不会被调用。
    pub fn subscribe<F>(&self, rewind: bool, mut callback: F) -> Subscription
    where
        F: FnMut(&NodeUpdate) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Subscription {
                map: Weak::new(),
                id: 0,
            };
        }

        if rewind {
            for node in inner.nodes.values() {
                callback(&NodeUpdate::join_from_state(node));
            }
        }

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push(Subscriber {
            id,
            callback: Box::new(callback),
        });

        Subscription {
            map: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// 拆除视图：丢弃全部订阅，之后不再触发任何回调。
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl fmt::Debug for NodeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NodeMap")
            .field("local_id", &inner.local_id)
            .field("nodes", &inner.nodes.len())
            .field("subscribers", &inner.subscribers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// 订阅句柄。
///
/// 丢弃句柄 **不会** 取消订阅，需显式调用 [`Subscription::unsubscribe`]。
#[must_use = "dropping a Subscription keeps the callback registered; call unsubscribe() to stop it"]
#[derive(Debug)]
pub struct Subscription {
    map: Weak<Mutex<Inner>>,
    id: u64,
}

impl Subscription {
    /// 取消订阅。返回后该回调不会再被调用。
    pub fn unsubscribe(self) {
        if let Some(inner) = self.map.upgrade() {
            inner.lock().subscribers.retain(|subscriber| subscriber.id != self.id);
        }
    }

    /// 订阅仍然登记在一个存活且未关闭的视图上。
    pub fn is_active(&self) -> bool {
        self.map.upgrade().is_some_and(|inner| {
            inner
                .lock()
                .subscribers
                .iter()
                .any(|subscriber| subscriber.id == self.id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_state::StateMap;
    use crate::update::Attributes;

    fn attrs(id: &str) -> Attributes {
        Attributes {
            id: id.to_owned(),
            service: "counter".to_owned(),
            locality: "eu-west-2a".to_owned(),
            revision: "v1".to_owned(),
        }
    }

    fn local() -> NodeState {
        NodeState::from_attributes(&attrs("local"), &StateMap::new(), 1)
    }

    #[test]
    fn seeds_local_node() {
        let map = NodeMap::new(local());
        assert_eq!(map.len(), 1);
        assert_eq!(map.local_id(), "local");
        assert_eq!(map.node("local").map(|node| node.created), Some(1));
    }

    #[test]
    fn join_refresh_preserves_created() {
        let map = NodeMap::new(local());
        let mut refreshed = attrs("local");
        refreshed.revision = "v2".to_owned();
        map.update(&NodeUpdate::join(refreshed, StateMap::new()))
            .expect("JOIN 刷新必须成功");
        let node = map.node("local").expect("本地节点必须存在");
        assert_eq!(node.revision, "v2");
        assert_eq!(node.created, 1);
    }

    #[test]
    fn join_without_attributes_is_rejected() {
        let map = NodeMap::new(local());
        let mut join = NodeUpdate::join(attrs("node-a"), StateMap::new());
        join.attributes = None;
        let err = map.update(&join).expect_err("缺少属性的 JOIN 必须被拒绝");
        assert!(err.is_protocol_violation());
        assert!(map.node("node-a").is_none());
    }

    #[test]
    fn join_with_mismatched_attributes_is_rejected() {
        let map = NodeMap::new(local());
        let mut join = NodeUpdate::join(attrs("node-a"), StateMap::new());
        join.node_id = "node-b".to_owned();
        assert!(matches!(
            map.update(&join),
            Err(RegistryError::AttributesMismatch { .. })
        ));
    }

    #[test]
    fn leave_of_unknown_node_is_silent() {
        let map = NodeMap::new(local());
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let _subscription = map.subscribe(false, move |_| *counter.lock() += 1);
        map.update(&NodeUpdate::leave("ghost"))
            .expect("未知节点的 LEAVE 是幂等的");
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn closed_map_stops_notifying() {
        let map = NodeMap::new(local());
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let subscription = map.subscribe(false, move |_| *counter.lock() += 1);
        map.close();
        assert!(!subscription.is_active());
        map.update(&NodeUpdate::join(attrs("node-a"), StateMap::new()))
            .expect("关闭后仍可应用更新");
        assert_eq!(*seen.lock(), 0);

        let late = map.subscribe(true, |_| panic!("关闭后的订阅不应被调用"));
        assert!(!late.is_active());
    }
}
