//! # partition 模块说明
//!
//! ## 角色定位（Why）
//! - 一致性哈希分区器属于外部协作者，本 crate 不实现哈希环；
//! - 这里只约定它的边界：分区器的唯一输入是经由 `NodeMap` 订阅观测到的成员变更。
//!
//! ## 设计要求（What）
//! - [`Partitioner::set_nodes`]：成员变化时以 `node_id -> address` 全量映射调用；
//! - [`Partitioner::node_for`]：确定性的路由决策；
//! - [`PartitionerBinding`]：以 rewind 订阅驱动分区器，仅依赖更新流本身维护映射，
//!   因为回调运行在 `NodeMap` 锁内，不能回头调用 `nodes()`。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::node_map::{NodeMap, Subscription};
use crate::update::{NodeUpdate, UpdateType};

/// 外部分区器契约。
pub trait Partitioner: Send + Sync {
    fn set_nodes(&self, nodes: BTreeMap<String, String>);

    fn node_for(&self, key: &str) -> Option<String>;
}

impl<P> Partitioner for Arc<P>
where
    P: Partitioner + ?Sized,
{
    fn set_nodes(&self, nodes: BTreeMap<String, String>) {
        (**self).set_nodes(nodes);
    }

    fn node_for(&self, key: &str) -> Option<String> {
        (**self).node_for(key)
    }
}

/// 选择参与分区的节点：服务类型匹配，且状态中带有地址键。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionFilter {
    pub service: String,
    pub addr_key: String,
}

impl PartitionFilter {
    pub fn new(service: impl Into<String>, addr_key: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            addr_key: addr_key.into(),
        }
    }
}

/// 由更新流驱动的分区器状态。
#[derive(Debug)]
struct BindingState {
    filter: PartitionFilter,
    members: BTreeSet<String>,
    addresses: BTreeMap<String, String>,
}

impl BindingState {
    /// 应用一条记录，返回路由映射是否变化。
    fn apply(&mut self, update: &NodeUpdate) -> bool {
        match update.update_type {
            UpdateType::Join => {
                let matches = update
                    .attributes
                    .as_ref()
                    .is_some_and(|attributes| attributes.service == self.filter.service);
                if !matches {
                    self.members.remove(&update.node_id);
                    return self.addresses.remove(&update.node_id).is_some();
                }
                self.members.insert(update.node_id.clone());
                match update.state.get(&self.filter.addr_key) {
                    Some(addr) => self.set(&update.node_id, addr),
                    None => self.addresses.remove(&update.node_id).is_some(),
                }
            }
            UpdateType::Update => {
                if !self.members.contains(&update.node_id) {
                    return false;
                }
                match update.state.get(&self.filter.addr_key) {
                    Some(addr) => self.set(&update.node_id, addr),
                    None => false,
                }
            }
            UpdateType::Leave => {
                self.members.remove(&update.node_id);
                self.addresses.remove(&update.node_id).is_some()
            }
        }
    }

    fn set(&mut self, node_id: &str, addr: &str) -> bool {
        let previous = self.addresses.insert(node_id.to_owned(), addr.to_owned());
        previous.as_deref() != Some(addr)
    }
}

/// 把 `NodeMap` 的成员变更接到分区器上。
pub struct PartitionerBinding;

impl PartitionerBinding {
    /// 建立绑定，返回底层订阅；调用 `unsubscribe` 即解除绑定。
    ///
    /// 回放与实时更新走同一个回调，只有路由映射真正变化时才调用 `set_nodes`。
    pub fn bind<P>(node_map: &NodeMap, partitioner: P, filter: PartitionFilter) -> Subscription
    where
        P: Partitioner + 'static,
    {
        let mut state = BindingState {
            filter,
            members: BTreeSet::new(),
            addresses: BTreeMap::new(),
        };
        let partitioner = Arc::new(partitioner);

        node_map.subscribe(true, move |update| {
            if state.apply(update) {
                partitioner.set_nodes(state.addresses.clone());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::node_state::{NodeState, StateMap};
    use crate::update::Attributes;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<BTreeMap<String, String>>>,
    }

    impl Partitioner for Recording {
        fn set_nodes(&self, nodes: BTreeMap<String, String>) {
            self.calls.lock().push(nodes);
        }

        fn node_for(&self, key: &str) -> Option<String> {
            let calls = self.calls.lock();
            let nodes = calls.last()?;
            let index = key.len() % nodes.len().max(1);
            nodes.values().nth(index).cloned()
        }
    }

    fn join(id: &str, service: &str, addr: Option<&str>) -> NodeUpdate {
        let mut state = StateMap::new();
        if let Some(addr) = addr {
            state.insert("addr.rpc".to_owned(), addr.to_owned());
        }
        NodeUpdate::join(
            Attributes {
                id: id.to_owned(),
                service: service.to_owned(),
                ..Attributes::default()
            },
            state,
        )
    }

    #[test]
    fn tracks_matching_service_addresses() {
        let map = NodeMap::new(NodeState {
            id: "frontend-1".to_owned(),
            service: "frontend".to_owned(),
            ..NodeState::default()
        });
        map.update(&join("counter-1", "counter", Some("10.0.0.1:9000")))
            .expect("join");

        let partitioner = Arc::new(Recording::default());
        let _binding = PartitionerBinding::bind(
            &map,
            Arc::clone(&partitioner),
            PartitionFilter::new("counter", "addr.rpc"),
        );
        map.update(&join("counter-2", "counter", None)).expect("join");
        map.update(&NodeUpdate::update(
            "counter-2",
            StateMap::from([("addr.rpc".to_owned(), "10.0.0.2:9000".to_owned())]),
        ))
        .expect("update");
        map.update(&join("frontend-2", "frontend", Some("10.0.0.9:9000")))
            .expect("join");
        map.update(&NodeUpdate::leave("counter-1")).expect("leave");

        let calls = partitioner.calls.lock();
        let last = calls.last().expect("分区器必须收到映射");
        assert_eq!(
            last,
            &BTreeMap::from([("counter-2".to_owned(), "10.0.0.2:9000".to_owned())])
        );
        // 回放 counter-1、counter-2 补地址、counter-1 离开，共三次变化。
        assert_eq!(calls.len(), 3);
    }
}
