use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::{
    DEFAULT_MAX_FRAME_BYTES, ReplicaTransport, UpdateRequest, UpdateResponse, validate_address,
};
use crate::error::{RegistryError, Result, RpcStatus};

#[derive(Debug)]
struct Connection {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: OwnedWriteHalf,
    /// 请求已写出但响应尚未读完；若 future 在此期间被丢弃，连接上可能残留旧响应。
    in_flight: bool,
}

/// 基于 TCP 的副本转发客户端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 以最小代价实现一元转发调用：每个请求写一行 JSON，读回一行 JSON 响应。
///
/// ## 逻辑 (How)
/// - 构造时只校验地址格式，不建立连接；第一次调用时才惰性建连；
/// - 任何 IO 失败都会丢弃当前连接并映射为 `unavailable`，下一次调用重新建连；
/// - 响应行经 `LinesCodec` 按 `max_frame_bytes` 限长读取，超长响应映射为 `internal` 并丢弃连接；
/// - 调用被中途取消（超时/关闭）后，连接被标记为不可复用，避免把上一条请求的响应
///   误认为下一条请求的结果。
///
/// ## 注意事项 (Trade-offs)
/// - 内部以 `tokio::sync::Mutex` 串行化请求，同一对端同一时刻只有一个在途请求，
///   与转发器“单循环顺序投递”的模型一致；
/// - 超过帧上限的请求在本地即被拒绝（`invalid_argument`），不会发往对端。
#[derive(Debug)]
pub struct TcpReplicaTransport {
    addr: String,
    max_frame_bytes: usize,
    connection: AsyncMutex<Option<Connection>>,
}

impl TcpReplicaTransport {
    /// 创建客户端；地址非法时立即失败，除此之外永不失败。
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        validate_address(&addr)?;
        Ok(Self {
            addr,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            connection: AsyncMutex::new(None),
        })
    }

    /// 调整单帧字节上限，对请求与响应同时生效。
    #[must_use]
    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    async fn open(addr: &str, max_frame_bytes: usize) -> Result<Connection> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| unavailable("connect", &err))?;
        stream
            .set_nodelay(true)
            .map_err(|err| unavailable("configure", &err))?;
        tracing::debug!(peer = addr, "connected to replica");
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes)),
            writer,
            in_flight: false,
        })
    }

    async fn exchange(connection: &mut Connection, frame: &[u8]) -> Result<UpdateResponse> {
        connection.in_flight = true;
        connection
            .writer
            .write_all(frame)
            .await
            .map_err(|err| unavailable("write", &err))?;

        let line = match connection.reader.next().await {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                return Err(RegistryError::rpc(
                    RpcStatus::Internal,
                    "replica response exceeds the frame limit",
                ));
            }
            Some(Err(LinesCodecError::Io(err))) => return Err(unavailable("read", &err)),
            None => {
                return Err(RegistryError::rpc(
                    RpcStatus::Unavailable,
                    "replica closed the connection",
                ));
            }
        };
        connection.in_flight = false;

        serde_json::from_str(line.trim_end()).map_err(|err| {
            RegistryError::rpc(RpcStatus::Internal, format!("malformed response: {err}"))
        })
    }
}

#[async_trait]
impl ReplicaTransport for TcpReplicaTransport {
    async fn update(&self, request: &UpdateRequest) -> Result<()> {
        let mut frame = serde_json::to_vec(request)?;
        if frame.len() > self.max_frame_bytes {
            return Err(RegistryError::rpc(
                RpcStatus::InvalidArgument,
                format!(
                    "request frame of {} bytes exceeds the {} byte limit",
                    frame.len(),
                    self.max_frame_bytes
                ),
            ));
        }
        frame.push(b'\n');

        let mut guard = self.connection.lock().await;
        if guard.as_ref().is_some_and(|connection| connection.in_flight) {
            tracing::debug!(peer = %self.addr, "discarding connection with abandoned request");
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(Self::open(&self.addr, self.max_frame_bytes).await?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(RegistryError::rpc(
                RpcStatus::Unavailable,
                "replica connection unavailable",
            ));
        };

        match Self::exchange(connection, &frame).await {
            Ok(response) => response.into_result(),
            Err(err) => {
                *guard = None;
                Err(err)
            }
        }
    }
}

fn unavailable(operation: &str, err: &std::io::Error) -> RegistryError {
    RegistryError::rpc(RpcStatus::Unavailable, format!("tcp {operation}: {err}"))
}
