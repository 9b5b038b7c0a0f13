//! # PendingQueue：丢最旧的有界待发送队列
//!
//! ## 核心意图（Why）
//! - 转发器的生产方（本地 `update` 调用）绝不能因为对端不可达而阻塞；
//! - 对端长期中断时内存不能无界增长，因此容量达到上限后淘汰最旧的一条，
//!   以新鲜度换完整性，缺失部分交由带外 read repair 修复。
//!
//! ## 行为契约（What）
//! - `push`：已关闭则静默丢弃；满容量先淘汰队首再追加；唤醒一个等待中的消费者；
//! - `take`：队列为空且未关闭时挂起；关闭后仍先交付已入队的更新，排空后才返回 `None`；
//! - `close`：幂等、终态，唤醒全部等待者。
//!
//! ## 实现策略（How）
//! - `parking_lot::Mutex<VecDeque<_>>` 保存缓冲区与关闭标记，锁内只做内存操作；
//! - `tokio::sync::Notify` 充当条件变量。消费者在检查状态 **之前** 先登记 `Notified`，
//!   随后在循环中重新检查条件，因此 push/close 与重新进入等待之间的竞争不会丢失唤醒。

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::pin::pin;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::update::NodeUpdate;

/// 一次 `push` 的结果。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PushOutcome {
    /// 正常入队。
    Queued,
    /// 入队成功，但为腾出空间淘汰了最旧的一条。
    Evicted(NodeUpdate),
    /// 队列已关闭，更新被丢弃。
    Discarded,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<NodeUpdate>,
    closed: bool,
    evicted: u64,
}

/// 有界、线程安全的待发送更新队列。
#[derive(Debug)]
pub struct PendingQueue {
    limit: NonZeroUsize,
    state: Mutex<QueueState>,
    available: Notify,
}

impl PendingQueue {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            limit,
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(limit.get().min(64)),
                ..QueueState::default()
            }),
            available: Notify::new(),
        }
    }

    /// 入队一条更新，永不阻塞。
    pub fn push(&self, update: NodeUpdate) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Discarded;
            }

            let evicted = if state.pending.len() >= self.limit.get() {
                state.evicted += 1;
                state.pending.pop_front()
            } else {
                None
            };
            state.pending.push_back(update);

            match evicted {
                Some(oldest) => {
                    tracing::debug!(
                        member_id = %oldest.node_id,
                        limit = self.limit.get(),
                        "pending updates at capacity; dropped oldest update"
                    );
                    PushOutcome::Evicted(oldest)
                }
                None => PushOutcome::Queued,
            }
        };
        self.available.notify_one();
        outcome
    }

    /// 取出下一条更新；队列关闭且已排空时返回 `None`。
    pub async fn take(&self) -> Option<NodeUpdate> {
        loop {
            let mut notified = pin!(self.available.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(update) = state.pending.pop_front() {
                    return Some(update);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// 关闭队列。之后的 `push` 全部丢弃，已入队的更新仍可被取走。
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit.get()
    }

    /// 自创建以来因容量淘汰的更新总数。
    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }

    /// 当前积压内容的副本，按出队顺序排列。
    pub fn snapshot(&self) -> Vec<NodeUpdate> {
        self.state.lock().pending.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::node_state::StateMap;

    fn update(n: u32) -> NodeUpdate {
        NodeUpdate::update(
            "node-a",
            StateMap::from([("seq".to_owned(), n.to_string())]),
        )
    }

    fn queue(limit: usize) -> PendingQueue {
        PendingQueue::new(NonZeroUsize::new(limit).expect("limit must be positive"))
    }

    #[test]
    fn push_beyond_limit_drops_oldest() {
        let queue = queue(2);
        assert_eq!(queue.push(update(1)), PushOutcome::Queued);
        assert_eq!(queue.push(update(2)), PushOutcome::Queued);
        assert_eq!(queue.push(update(3)), PushOutcome::Evicted(update(1)));
        assert_eq!(queue.push(update(4)), PushOutcome::Evicted(update(2)));
        assert_eq!(queue.snapshot(), vec![update(3), update(4)]);
        assert_eq!(queue.evicted(), 2);
    }

    #[test]
    fn push_after_close_is_discarded() {
        let queue = queue(4);
        queue.close();
        queue.close();
        assert_eq!(queue.push(update(1)), PushOutcome::Discarded);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn close_drains_before_signalling_done() {
        let queue = queue(4);
        queue.push(update(1));
        queue.close();
        assert_eq!(queue.take().await, Some(update(1)));
        assert_eq!(queue.take().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_consumer_wakes_on_push() {
        let queue = Arc::new(queue(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(update(7));
        let taken = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("消费者必须被唤醒")
            .expect("消费者任务不应 panic");
        assert_eq!(taken, Some(update(7)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_wakes_every_waiter() {
        let queue = Arc::new(queue(4));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.take().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        for waiter in waiters {
            let taken = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("关闭必须唤醒所有等待者")
                .expect("等待任务不应 panic");
            assert_eq!(taken, None);
        }
    }
}
