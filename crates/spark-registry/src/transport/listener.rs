use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::{DEFAULT_MAX_FRAME_BYTES, UpdateRequest, UpdateResponse, validate_address};
use crate::error::{RegistryError, Result, RpcStatus};
use crate::node_map::NodeMap;

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// 副本转发的接收端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让对端转发过来的更新落到本地 `NodeMap`，完成副本间的状态传播。
///
/// ## 逻辑 (How)
/// - 一个接入任务 + 每连接一个服务任务，统一挂在同一个 `CancellationToken` 下；
/// - 每行经 `LinesCodec` 限长解码为 [`UpdateRequest`]，应用其中的 `member`，回写一行 [`UpdateResponse`]；
/// - 协议违规回写 `invalid_argument`，无法解码的帧回写 `internal`，连接保持可用；
/// - 超过帧上限的行不会被缓冲：记录 `warn` 后直接断开该连接；
/// - `accept` 连续失败（如文件描述符耗尽）时按指数退避休眠，成功一次即复位。
///
/// ## 契约 (What)
/// - 重复投递无害：JOIN/UPDATE/LEAVE 的应用本身是幂等的；
/// - [`ReplicaListener::close`] 返回后，接入任务与全部连接任务均已退出。
#[derive(Debug)]
pub struct ReplicaListener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaListener {
    /// 以默认帧上限绑定地址并开始接收转发。
    pub async fn bind(addr: &str, node_map: NodeMap) -> Result<Self> {
        Self::bind_with_limit(addr, node_map, DEFAULT_MAX_FRAME_BYTES).await
    }

    /// 绑定地址，单行请求超过 `max_frame_bytes` 字节的连接会被断开。
    pub async fn bind_with_limit(
        addr: &str,
        node_map: NodeMap,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        validate_address(addr)?;
        if max_frame_bytes == 0 {
            return Err(RegistryError::InvalidConfig {
                field: "max_frame_bytes",
                reason: "must be greater than zero".to_owned(),
            });
        }
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, max_frame_bytes, "replica listener bound");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            node_map,
            max_frame_bytes,
            cancel.clone(),
        ));
        Ok(Self {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止接收并等待全部后台任务退出。幂等。
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "replica listener task panicked");
            }
        }
    }
}

impl Drop for ReplicaListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 第 `failures` 次连续 `accept` 失败后的休眠时长。
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_INITIAL
        .saturating_mul(1 << exponent)
        .min(ACCEPT_BACKOFF_MAX)
}

async fn accept_loop(
    listener: TcpListener,
    node_map: NodeMap,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    let mut failures = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    tracing::debug!(%peer, "accepted replica connection");
                    connections.spawn(serve_connection(
                        stream,
                        node_map.clone(),
                        max_frame_bytes,
                        cancel.clone(),
                    ));
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    tracing::warn!(
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "failed to accept replica connection"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    while connections.join_next().await.is_some() {}
    tracing::debug!("replica listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    node_map: NodeMap,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes));
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            None => break,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(
                    peer = ?peer,
                    max_frame_bytes,
                    "oversized replica frame; closing connection"
                );
                break;
            }
            Some(Err(LinesCodecError::Io(err))) => {
                tracing::debug!(error = %err, "replica connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_frame(&node_map, &line);
        let mut frame = match serde_json::to_vec(&response) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode replica response");
                break;
            }
        };
        frame.push(b'\n');
        if let Err(err) = writer.write_all(&frame).await {
            tracing::debug!(error = %err, "replica connection write failed");
            break;
        }
    }
}

fn handle_frame(node_map: &NodeMap, line: &str) -> UpdateResponse {
    let request: UpdateRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "malformed replica frame");
            return UpdateResponse::Error {
                status: RpcStatus::Internal,
                message: RegistryError::from(err).to_string(),
            };
        }
    };

    match node_map.update(&request.member) {
        Ok(()) => UpdateResponse::Ok,
        Err(err) => {
            tracing::debug!(
                source = %request.source_node_id,
                member_id = %request.member.node_id,
                error = %err,
                "rejected forwarded update"
            );
            UpdateResponse::from_error(&err)
        }
    }
}
