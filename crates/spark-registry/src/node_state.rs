//! 节点状态模型。
//!
//! # 教案式说明
//! - **意图（Why）**：描述集群中单个节点的身份（id/service/locality/revision/created）
//!   与其生命周期内可变的键值状态，是 `NodeMap` 对外暴露的快照单元；
//! - **契约（What）**：状态映射永远存在（空映射而非缺失），复制即深拷贝，
//!   两个持有者之间互不可见对方的修改；
//! - **实现（How）**：状态映射采用 `BTreeMap`，保证序列化与比较结果确定。

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::update::Attributes;

/// 节点状态映射：键与值均为字符串。
pub type StateMap = BTreeMap<String, String>;

/// 集群中一个节点对外传播的状态。
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// 节点在集群内的唯一标识，创建后不可变。
    pub id: String,
    /// 节点承担的服务角色，例如 `counter`、`frontend`。
    pub service: String,
    /// 自由格式的部署位置提示，供外部路由/亲和策略使用。
    pub locality: String,
    /// 注册时刻，UNIX 毫秒。
    pub created: i64,
    /// 所运行软件版本的不透明标签。
    pub revision: String,
    /// 节点的服务状态。
    #[serde(default)]
    pub state: StateMap,
}

impl NodeState {
    /// 由 JOIN 携带的属性与初始状态构造节点。
    pub fn from_attributes(attributes: &Attributes, state: &StateMap, created: i64) -> Self {
        Self {
            id: attributes.id.clone(),
            service: attributes.service.clone(),
            locality: attributes.locality.clone(),
            created,
            revision: attributes.revision.clone(),
            state: state.clone(),
        }
    }

    /// 返回一份与原值完全隔离的副本。
    ///
    /// 状态映射被重新分配，修改副本不会影响原值，反之亦然。
    pub fn copy(&self) -> Self {
        Self {
            state: copy_state(Some(&self.state)),
            ..self.clone()
        }
    }

    /// 抽取节点的身份属性，用于合成 JOIN 记录。
    pub fn attributes(&self) -> Attributes {
        Attributes {
            id: self.id.clone(),
            service: self.service.clone(),
            locality: self.locality.clone(),
            revision: self.revision.clone(),
        }
    }
}

/// 复制状态映射；`None` 返回空映射，消费方无需区分“尚无状态”与“状态为空”。
pub fn copy_state(state: Option<&StateMap>) -> StateMap {
    state.cloned().unwrap_or_default()
}

/// 当前墙钟时间，UNIX 毫秒。
///
/// 系统时钟早于 UNIX 纪元时返回 0。
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
