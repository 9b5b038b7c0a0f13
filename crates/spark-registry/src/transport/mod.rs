//! # transport 模块说明
//!
//! ## 角色定位（Why）
//! - 副本转发 RPC 的边界：一次一元调用携带 `{member, source_node_id}`，接收端幂等应用；
//! - 转发器只依赖 [`ReplicaTransport`] 契约，具体协议（此处为 TCP 上的换行分隔 JSON）可替换。
//!
//! ## 组成（What）
//! - [`ReplicaTransport`]：异步一元调用契约；
//! - [`RetryingTransport`]：有界次数 + 指数退避 + 状态码过滤的重试包装；
//! - [`TcpReplicaTransport`]：惰性建连、故障后自动重连的 TCP 客户端；
//! - [`ReplicaListener`]：接收端，把收到的更新应用到本地 `NodeMap` 并回写结果。
//!
//! ## 线格式（How）
//! - 每个请求、响应各占一行 JSON，以 `\n` 结尾；
//! - 响应为 `{"outcome":"ok"}` 或 `{"outcome":"error","status":"...","message":"..."}`。
//! - 每行（不含 `\n`）不得超过帧上限（默认 [`DEFAULT_MAX_FRAME_BYTES`]），
//!   任何一端读到超长行都直接断开连接，不会把整行缓冲进内存。

mod listener;
mod retry;
mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result, RpcStatus};
use crate::update::NodeUpdate;

pub use crate::config::DEFAULT_MAX_FRAME_BYTES;

pub use listener::ReplicaListener;
pub use retry::RetryingTransport;
pub use tcp::TcpReplicaTransport;

/// 转发 RPC 的请求体。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub member: NodeUpdate,
    pub source_node_id: String,
}

/// 转发 RPC 的响应体。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateResponse {
    Ok,
    Error { status: RpcStatus, message: String },
}

impl UpdateResponse {
    pub fn from_error(error: &RegistryError) -> Self {
        UpdateResponse::Error {
            status: error.status(),
            message: error.to_string(),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            UpdateResponse::Ok => Ok(()),
            UpdateResponse::Error { status, message } => Err(RegistryError::rpc(status, message)),
        }
    }
}

/// 向单个对端副本投递更新的一元调用契约。
///
/// # 契约说明
/// - 实现必须可被丢弃中途取消：转发器在超时或关闭时会直接丢弃进行中的 future；
/// - 失败以 [`RegistryError`] 返回，其 [`RegistryError::status`] 决定是否值得重试。
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn update(&self, request: &UpdateRequest) -> Result<()>;
}

#[async_trait]
impl<T> ReplicaTransport for Arc<T>
where
    T: ReplicaTransport + ?Sized,
{
    async fn update(&self, request: &UpdateRequest) -> Result<()> {
        (**self).update(request).await
    }
}

#[async_trait]
impl<T> ReplicaTransport for Box<T>
where
    T: ReplicaTransport + ?Sized,
{
    async fn update(&self, request: &UpdateRequest) -> Result<()> {
        (**self).update(request).await
    }
}

/// 校验 `host:port` 形式的地址，不做 DNS 解析。
pub(crate) fn validate_address(addr: &str) -> Result<()> {
    let invalid = |reason: &str| RegistryError::InvalidAddress {
        addr: addr.to_owned(),
        reason: reason.to_owned(),
    };

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() || host == "[]" {
        return Err(invalid("missing host"));
    }
    match port.parse::<u16>() {
        Ok(_) => Ok(()),
        Err(_) => Err(invalid("port must be an integer in 0..=65535")),
    }
}
