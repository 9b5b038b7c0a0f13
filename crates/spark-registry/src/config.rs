//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 汇总核心消费的全部可调参数：单次投递超时、待发送队列容量、传输层重试节律；
//! - 为副本二进制提供 TOML 形式的装配入口。
//!
//! ## 设计要求（What）
//! - 所有字段都有默认值（`#[serde(default)]`），配置文件只需覆盖关心的项；
//! - 时长在配置文件中以毫秒整数表示，代码侧通过访问器换算为 [`Duration`]；
//! - [`ForwarderConfig::validate`] 在构造转发器前执行，非法取值属于构造期失败。
//!
//! ## 默认值取舍（Trade-offs）
//! - 重试策略默认 5 次尝试、初始退避 200ms、上限 10s、倍率 2，仅对 `unavailable` 重试；
//! - 队列容量默认 1024：对端长时间不可达时最多积压这么多条，再多就丢最旧的；
//! - 单帧上限默认 1 MiB：副本连接上的一行超过该长度即视为对端失常，连接被断开。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result, RpcStatus};
use crate::transport;

const DEFAULT_UPDATE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PENDING_UPDATES_LIMIT: usize = 1_024;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1_000;
/// 副本连接上单行帧（不含换行符）的默认字节上限。
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 200;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const JITTER_RANGE: f64 = 0.1;

/// 单个副本转发器的配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwarderConfig {
    /// 单条更新（含其下全部重试）的投递截止时间，毫秒。
    pub update_timeout_ms: u64,
    /// 待发送队列容量上限，必须为正。
    pub pending_updates_limit: usize,
    /// 优雅关闭时允许队列自然排空的时长，毫秒。
    pub shutdown_grace_ms: u64,
    /// 响应帧的字节上限，超出即断开连接。
    pub max_frame_bytes: usize,
    /// 传输层重试策略。
    pub retry: RetryPolicy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            update_timeout_ms: DEFAULT_UPDATE_TIMEOUT_MS,
            pending_updates_limit: DEFAULT_PENDING_UPDATES_LIMIT,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            retry: RetryPolicy::default(),
        }
    }
}

impl ForwarderConfig {
    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    #[must_use]
    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout_ms = duration_to_millis(timeout);
        self
    }

    #[must_use]
    pub fn with_pending_updates_limit(mut self, limit: usize) -> Self {
        self.pending_updates_limit = limit;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = duration_to_millis(grace);
        self
    }

    #[must_use]
    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 校验配置取值。
    ///
    /// # 契约
    /// - `update_timeout_ms`、`pending_updates_limit` 与 `max_frame_bytes` 必须大于 0；
    /// - 重试策略需满足 [`RetryPolicy::validate`]；
    /// - 失败时返回 [`RegistryError::InvalidConfig`]，指明出错字段。
    pub fn validate(&self) -> Result<()> {
        if self.update_timeout_ms == 0 {
            return Err(invalid("update_timeout_ms", "must be greater than zero"));
        }
        if self.pending_updates_limit == 0 {
            return Err(invalid("pending_updates_limit", "must be greater than zero"));
        }
        if self.max_frame_bytes == 0 {
            return Err(invalid("max_frame_bytes", "must be greater than zero"));
        }
        self.retry.validate()
    }
}

/// 传输层重试策略：有界尝试次数、指数退避、按状态码过滤。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// 总尝试次数（含首发），至少为 1。
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// 允许重试的状态码。
    pub retryable: Vec<RpcStatus>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            multiplier: DEFAULT_MULTIPLIER,
            retryable: vec![RpcStatus::Unavailable],
        }
    }
}

impl RetryPolicy {
    /// 不做任何重试的策略，常用于测试。
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff_ms = duration_to_millis(initial);
        self.max_backoff_ms = duration_to_millis(max);
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, statuses: impl IntoIterator<Item = RpcStatus>) -> Self {
        self.retryable = statuses.into_iter().collect();
        self
    }

    pub fn is_retryable(&self, status: RpcStatus) -> bool {
        self.retryable.contains(&status)
    }

    /// 第 `retry` 次重试（从 1 开始）前的等待时长。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：`initial * multiplier^(retry-1)`，夹紧到 `max_backoff`；
    ///   再叠加 ±10% 的确定性抖动（SplitMix64），避免大量转发器在同一时刻集体重试；
    /// - **契约 (What)**：相同的 `retry` 与 `salt` 总是得到相同结果，便于测试复现；
    ///   返回值永远不超过 `max_backoff`。
    pub fn backoff(&self, retry: u32, salt: u64) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let max_ms = self.max_backoff_ms as f64;
        let base_ms = (self.initial_backoff_ms as f64 * self.multiplier.powi(exponent)).min(max_ms);
        let jittered = base_ms * jitter_factor(salt ^ u64::from(retry));
        Duration::from_secs_f64(jittered.clamp(0.0, max_ms) / 1_000.0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be a finite value >= 1.0"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(invalid(
                "retry.initial_backoff_ms",
                "must not exceed retry.max_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// 副本二进制的完整配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaConfig {
    pub node_id: String,
    /// 接收对端转发的监听地址，`host:port`。
    pub listen: String,
    /// 对端副本地址列表。
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// 接收端请求帧的字节上限。
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
}

impl ReplicaConfig {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ReplicaConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(invalid("node_id", "must not be empty"));
        }
        if self.max_frame_bytes == 0 {
            return Err(invalid("max_frame_bytes", "must be greater than zero"));
        }
        transport::validate_address(&self.listen)?;
        for peer in &self.peers {
            transport::validate_address(peer)?;
        }
        self.forwarder.validate()
    }
}

fn default_service() -> String {
    "registry".to_owned()
}

fn default_revision() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}

fn default_log_filter() -> String {
    "info".to_owned()
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn invalid(field: &'static str, reason: &str) -> RegistryError {
    RegistryError::InvalidConfig {
        field,
        reason: reason.to_owned(),
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[inline]
fn jitter_factor(seed: u64) -> f64 {
    let mixed = mix64(seed);
    let unit = (mixed >> 11) as f64 / ((1u64 << 53) as f64);
    1.0 + (unit * 2.0 - 1.0) * JITTER_RANGE
}

#[inline]
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}
