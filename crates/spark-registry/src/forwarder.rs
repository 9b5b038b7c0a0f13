//! # ReplicaForwarder：面向单个对端副本的转发器
//!
//! ## 核心意图（Why）
//! - 把本地更新尽力而为地送达某一个对端副本，同时保证生产方永不阻塞：
//!   无论对端是否健康，`update` 都只是一次内存入队；
//! - 每个对端一个实例，各自拥有独立的队列、后台任务与取消上下文。
//!
//! ## 状态机（What）
//! - **Connecting**：构造时只创建传输句柄，不要求建连成功；连接在第一次投递时惰性建立；
//! - **Forwarding**：单个后台循环反复 `take()`，对每条更新在 `update_timeout` 内发起一次调用，
//!   传输层重试在调用之下完成；失败（重试耗尽/超时）只记录日志并丢弃，绝不回队列、
//!   绝不阻塞后续更新；
//! - **Closed**：`close()` 依次取消共享上下文、关闭队列、等待后台循环退出；之后的 `update`
//!   会被队列直接丢弃。
//!
//! ## 风险提示（Trade-offs）
//! - 丢弃是刻意的策略：陈旧更新的价值低于及时更新，持久性由带外 read repair 负责；
//! - 关闭时取消先于关闭队列，残留在队列中的更新会被快速排空丢弃，不再发起网络调用。

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ForwarderConfig;
use crate::error::{RegistryError, Result};
use crate::pending::{PendingQueue, PushOutcome};
use crate::transport::{ReplicaTransport, RetryingTransport, TcpReplicaTransport, UpdateRequest};
use crate::update::NodeUpdate;

/// 单个对端副本的异步转发器。
#[derive(Debug)]
pub struct ReplicaForwarder {
    peer: String,
    queue: Arc<PendingQueue>,
    cancel: CancellationToken,
    shutdown_grace: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaForwarder {
    /// 通过 TCP 连接到 `addr` 处的对端副本。
    ///
    /// # 契约
    /// - 地址非法、配置非法或不在 Tokio 运行时内调用时返回错误，且不会遗留任何后台任务；
    /// - 不等待连接建立：对端此刻不可达并不影响构造成功。
    pub fn connect(
        addr: impl Into<String>,
        local_id: impl Into<String>,
        config: ForwarderConfig,
    ) -> Result<Self> {
        let addr = addr.into();
        config.validate()?;
        let transport = RetryingTransport::new(
            TcpReplicaTransport::new(addr.clone())?.with_max_frame_bytes(config.max_frame_bytes),
            config.retry.clone(),
        );
        Self::with_transport(addr, local_id, transport, config)
    }

    /// 使用任意传输实现构造转发器。
    ///
    /// `peer` 仅用于日志标识。
    pub fn with_transport<T>(
        peer: impl Into<String>,
        local_id: impl Into<String>,
        transport: T,
        config: ForwarderConfig,
    ) -> Result<Self>
    where
        T: ReplicaTransport + 'static,
    {
        config.validate()?;
        let limit = NonZeroUsize::new(config.pending_updates_limit).ok_or_else(|| {
            RegistryError::InvalidConfig {
                field: "pending_updates_limit",
                reason: "must be greater than zero".to_owned(),
            }
        })?;
        let runtime = Handle::try_current().map_err(|_| RegistryError::RuntimeUnavailable)?;

        let peer = peer.into();
        let queue = Arc::new(PendingQueue::new(limit));
        let cancel = CancellationToken::new();
        let forward_loop = ForwardLoop {
            peer: peer.clone(),
            local_id: local_id.into(),
            queue: Arc::clone(&queue),
            cancel: cancel.clone(),
            transport,
            update_timeout: config.update_timeout(),
        };
        let task = runtime.spawn(forward_loop.run());

        Ok(Self {
            peer,
            queue,
            cancel,
            shutdown_grace: config.shutdown_grace(),
            task: Mutex::new(Some(task)),
        })
    }

    /// 把更新交给后台循环，立即返回。
    ///
    /// 队列满时淘汰最旧的更新；转发器已关闭时更新被丢弃。
    pub fn update(&self, update: NodeUpdate) -> PushOutcome {
        self.queue.push(update)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// 尚未取走的积压更新数。
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// 因容量压力淘汰的更新总数。
    pub fn evicted(&self) -> u64 {
        self.queue.evicted()
    }

    /// 配置中的优雅关闭时长，供门面统一关闭时使用。
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 立即关闭：取消在途调用、关闭队列、等待后台循环退出。幂等。
    pub async fn close(&self) {
        self.cancel.cancel();
        self.queue.close();
        self.join().await;
    }

    /// 优雅关闭：先关闭队列让后台循环最多用 `grace` 时长排空积压，再执行 [`Self::close`]。
    pub async fn shutdown(&self, grace: Duration) {
        self.queue.close();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(joined) => log_join(&self.peer, joined),
                Err(_) => {
                    tracing::debug!(
                        peer = %self.peer,
                        pending = self.queue.len(),
                        "shutdown grace elapsed; cancelling forwarder"
                    );
                    self.cancel.cancel();
                    log_join(&self.peer, task.await);
                }
            }
        }
        self.close().await;
    }

    async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            log_join(&self.peer, task.await);
        }
    }
}

impl Drop for ReplicaForwarder {
    fn drop(&mut self) {
        if self.task.get_mut().is_some() {
            tracing::warn!(peer = %self.peer, "replica forwarder dropped without close()");
            self.cancel.cancel();
            self.queue.close();
        }
    }
}

fn log_join(peer: &str, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!(peer, error = %err, "replica forwarder task panicked");
    }
}

struct ForwardLoop<T> {
    peer: String,
    local_id: String,
    queue: Arc<PendingQueue>,
    cancel: CancellationToken,
    transport: T,
    update_timeout: Duration,
}

impl<T> ForwardLoop<T>
where
    T: ReplicaTransport,
{
    async fn run(self) {
        while let Some(member) = self.queue.take().await {
            if self.cancel.is_cancelled() {
                tracing::debug!(
                    peer = %self.peer,
                    member_id = %member.node_id,
                    "forwarder closing; dropped pending update"
                );
                continue;
            }

            let request = UpdateRequest {
                member,
                source_node_id: self.local_id.clone(),
            };
            if let Err(err) = self.forward(&request).await {
                tracing::warn!(
                    peer = %self.peer,
                    member_id = %request.member.node_id,
                    error = %err,
                    "failed to forward update"
                );
            }
        }
        tracing::debug!(peer = %self.peer, "replica forwarder loop exited");
    }

    async fn forward(&self, request: &UpdateRequest) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RegistryError::Cancelled),
            outcome = tokio::time::timeout(self.update_timeout, self.transport.update(request)) => {
                outcome.unwrap_or_else(|_| Err(RegistryError::Timeout { after: self.update_timeout }))
            }
        }
    }
}
