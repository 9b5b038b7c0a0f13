//! 更新记录的线格式。
//!
//! # 教案式说明
//! - **意图（Why）**：JOIN/UPDATE/LEAVE 是服务端注册表、对端副本与本地 `NodeMap`
//!   之间唯一的交换单元，需要一份稳定、可序列化的表示；
//! - **契约（What）**：
//!   - JOIN 必须携带 `attributes`，`state` 为初始全量状态；
//!   - UPDATE 的 `state` 是合并补丁，只修改列出的键，可以为空（无操作）；
//!   - LEAVE 两者都不需要；
//! - **实现（How）**：`attributes` 缺省时不序列化，`state` 缺省时反序列化为空映射。

use serde::{Deserialize, Serialize};

use crate::node_state::{NodeState, StateMap};

/// 更新类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    Join,
    Update,
    Leave,
}

/// JOIN 携带的节点身份属性。
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Attributes {
    pub id: String,
    pub service: String,
    pub locality: String,
    pub revision: String,
}

/// 作用于 `NodeMap` 的一条更新记录。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub node_id: String,
    pub update_type: UpdateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub state: StateMap,
}

impl NodeUpdate {
    /// 构造 JOIN 记录，`node_id` 取自属性中的 id。
    pub fn join(attributes: Attributes, state: StateMap) -> Self {
        Self {
            node_id: attributes.id.clone(),
            update_type: UpdateType::Join,
            attributes: Some(attributes),
            state,
        }
    }

    /// 构造 UPDATE 合并补丁。
    pub fn update(node_id: impl Into<String>, patch: StateMap) -> Self {
        Self {
            node_id: node_id.into(),
            update_type: UpdateType::Update,
            attributes: None,
            state: patch,
        }
    }

    /// 构造 LEAVE 记录。
    pub fn leave(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            update_type: UpdateType::Leave,
            attributes: None,
            state: StateMap::new(),
        }
    }

    /// 由已知节点状态合成 JOIN，供订阅回放（rewind）使用。
    pub fn join_from_state(node: &NodeState) -> Self {
        Self::join(node.attributes(), node.state.clone())
    }
}
