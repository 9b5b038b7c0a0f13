use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::{ReplicaTransport, UpdateRequest};
use crate::config::RetryPolicy;
use crate::error::Result;

static NEXT_SALT: AtomicU64 = AtomicU64::new(1);

/// 为任意传输叠加重试策略。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 对端短暂不可达（重启、网络抖动）时，在单条更新的截止时间内自动重试，
///   转发循环本身无需关心重试细节。
///
/// ## 逻辑 (How)
/// - 最多尝试 `max_attempts` 次；仅当失败状态码在 `retryable` 列表中时才重试；
/// - 两次尝试之间按 [`RetryPolicy::backoff`] 休眠，每个实例持有独立的抖动种子，
///   避免多个转发器同步重试。
///
/// ## 注意事项 (Trade-offs)
/// - 休眠是可取消的：转发器超时或关闭时整个 future 被丢弃，退避随之终止；
/// - 不可重试的错误（如 `invalid_argument`）立即返回。
#[derive(Debug)]
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
    salt: u64,
}

impl<T> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            salt: NEXT_SALT.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T> ReplicaTransport for RetryingTransport<T>
where
    T: ReplicaTransport,
{
    async fn update(&self, request: &UpdateRequest) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.inner.update(request).await {
                Ok(()) => return Ok(()),
                Err(err)
                    if attempt < self.policy.max_attempts
                        && self.policy.is_retryable(err.status()) =>
                {
                    let delay = self.policy.backoff(attempt, self.salt);
                    tracing::debug!(
                        member_id = %request.member.node_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying replica update"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::error::{RegistryError, RpcStatus};
    use crate::update::NodeUpdate;

    struct Failing {
        status: RpcStatus,
        succeed_after: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReplicaTransport for Failing {
        async fn update(&self, _request: &UpdateRequest) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call > self.succeed_after {
                Ok(())
            } else {
                Err(RegistryError::rpc(self.status, "injected"))
            }
        }
    }

    fn request() -> UpdateRequest {
        UpdateRequest {
            member: NodeUpdate::leave("node-a"),
            source_node_id: "local".to_owned(),
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(attempts)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(100), 2.0)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_unavailable_until_success() {
        let transport = RetryingTransport::new(
            Failing {
                status: RpcStatus::Unavailable,
                succeed_after: 2,
                calls: AtomicUsize::new(0),
            },
            policy(5),
        );
        transport.update(&request()).await.expect("第三次尝试应成功");
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let transport = RetryingTransport::new(
            Failing {
                status: RpcStatus::Unavailable,
                succeed_after: usize::MAX,
                calls: AtomicUsize::new(0),
            },
            policy(3),
        );
        let err = transport.update(&request()).await.expect_err("重试耗尽必须失败");
        assert_eq!(err.status(), RpcStatus::Unavailable);
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_fails_fast() {
        let transport = RetryingTransport::new(
            Failing {
                status: RpcStatus::InvalidArgument,
                succeed_after: usize::MAX,
                calls: AtomicUsize::new(0),
            },
            policy(5),
        );
        let err = transport.update(&request()).await.expect_err("不可重试的错误立即返回");
        assert_eq!(err.status(), RpcStatus::InvalidArgument);
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_policy_attempts_once_even_for_retryable_status() {
        let transport = RetryingTransport::new(
            Failing {
                status: RpcStatus::Unavailable,
                succeed_after: 1,
                calls: AtomicUsize::new(0),
            },
            RetryPolicy::no_retry(),
        );
        let err = transport.update(&request()).await.expect_err("单次尝试失败即返回");
        assert_eq!(err.status(), RpcStatus::Unavailable);
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 1);
    }
}
