//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为注册表对外暴露的错误语义提供集中定义，区分协议违规、瞬时投递失败与构造期失败；
//! - 每个变体都带稳定错误码，便于日志检索与告警聚合。
//!
//! ## 分类约定（What）
//! - **协议违规**（如对未知节点执行 UPDATE）：由 `NodeMap::update` 同步返回，调用方自行决定处理方式；
//! - **瞬时投递失败**（`Rpc`/`Timeout`/`Cancelled`）：只在转发器内部流转，重试耗尽后记录日志并丢弃；
//! - **构造期失败**（`InvalidAddress`/`InvalidConfig`/`RuntimeUnavailable`）：直接返回给构造调用方，
//!   不会留下半初始化的后台任务。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// crate 内统一的返回值别名。
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// 转发 RPC 的结果状态。
///
/// 取值与重试策略配置中的 `retryable` 列表一一对应，同时作为接收端回写给发送端的状态码。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcStatus {
    /// 对端不可达或连接中断。
    Unavailable,
    /// 单次调用超出截止时间。
    DeadlineExceeded,
    /// 调用方取消。
    Cancelled,
    /// 请求本身不合法，例如对未知节点的 UPDATE。
    InvalidArgument,
    /// 对端内部错误，例如无法解码的帧。
    Internal,
}

impl RpcStatus {
    /// 稳定的小写名称，与序列化形式一致。
    pub fn as_str(self) -> &'static str {
        match self {
            RpcStatus::Unavailable => "unavailable",
            RpcStatus::DeadlineExceeded => "deadline_exceeded",
            RpcStatus::Cancelled => "cancelled",
            RpcStatus::InvalidArgument => "invalid_argument",
            RpcStatus::Internal => "internal",
        }
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册表错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合视图应用、副本转发与配置装配路径上的全部异常，
///   让 `?` 在整个 crate 内直接生效；
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可安全跨任务传播；
///   - [`RegistryError::code`] 返回稳定错误码，前缀统一为 `spark.registry.`；
///   - [`RegistryError::is_protocol_violation`] 用于区分“调用方写错了”与“网络出了问题”；
/// - **设计权衡 (Trade-offs)**：上下文使用 `String` 保存，牺牲少量分配换取可读的诊断信息。
#[derive(Debug, Error)]
pub enum RegistryError {
    /// 对尚未 JOIN 的节点执行 UPDATE。
    #[error("node `{node_id}` is not registered; it must join before updating")]
    UnknownNode { node_id: String },

    /// JOIN 记录缺少 attributes。
    #[error("join for node `{node_id}` carries no attributes")]
    MissingAttributes { node_id: String },

    /// JOIN 记录中的 attributes.id 与 node_id 不一致。
    #[error("join for node `{node_id}` carries attributes for `{attributes_id}`")]
    AttributesMismatch {
        node_id: String,
        attributes_id: String,
    },

    /// 地址无法解析为 `host:port`。
    #[error("invalid replica address `{addr}`: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// 配置项取值非法。
    #[error("invalid configuration `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// 在 Tokio 运行时之外构造了需要后台任务的组件。
    #[error("no tokio runtime available to spawn background tasks")]
    RuntimeUnavailable,

    /// 传输层调用失败。
    #[error("rpc failed with status {status}: {message}")]
    Rpc { status: RpcStatus, message: String },

    /// 单次更新超出投递截止时间。
    #[error("update timed out after {after:?}")]
    Timeout { after: Duration },

    /// 后台工作被关闭流程取消。
    #[error("operation cancelled")]
    Cancelled,

    /// 线格式编解码失败。
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// 监听、接入等本地 IO 失败。
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    /// TOML 配置解析失败。
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl RegistryError {
    /// 构造一次携带状态码的传输层错误。
    pub fn rpc(status: RpcStatus, message: impl Into<String>) -> Self {
        RegistryError::Rpc {
            status,
            message: message.into(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::UnknownNode { .. } => "spark.registry.unknown_node",
            RegistryError::MissingAttributes { .. } => "spark.registry.missing_attributes",
            RegistryError::AttributesMismatch { .. } => "spark.registry.attributes_mismatch",
            RegistryError::InvalidAddress { .. } => "spark.registry.invalid_address",
            RegistryError::InvalidConfig { .. } => "spark.registry.invalid_config",
            RegistryError::RuntimeUnavailable => "spark.registry.runtime_unavailable",
            RegistryError::Rpc { .. } => "spark.registry.rpc_failed",
            RegistryError::Timeout { .. } => "spark.registry.timeout",
            RegistryError::Cancelled => "spark.registry.cancelled",
            RegistryError::Codec(_) => "spark.registry.codec",
            RegistryError::Io(_) => "spark.registry.io",
            RegistryError::ConfigParse(_) => "spark.registry.config_parse",
        }
    }

    /// 是否属于更新流本身的协议违规。
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            RegistryError::UnknownNode { .. }
                | RegistryError::MissingAttributes { .. }
                | RegistryError::AttributesMismatch { .. }
        )
    }

    /// 把错误折叠为线上的 [`RpcStatus`]，供接收端回写以及重试判定使用。
    pub fn status(&self) -> RpcStatus {
        match self {
            RegistryError::Rpc { status, .. } => *status,
            RegistryError::Timeout { .. } => RpcStatus::DeadlineExceeded,
            RegistryError::Cancelled => RpcStatus::Cancelled,
            RegistryError::Io(_) => RpcStatus::Unavailable,
            err if err.is_protocol_violation() => RpcStatus::InvalidArgument,
            _ => RpcStatus::Internal,
        }
    }
}
