//! 日志初始化的便捷出口。
//!
//! # 教案式说明
//! - **意图（Why）**：库代码只通过 `tracing` 宏产出事件，从不自行安装订阅器；
//!   可执行入口（副本二进制、集成测试）需要一个统一的初始化函数；
//! - **逻辑（How）**：`fmt` 订阅器 + `EnvFilter`，优先读取 `RUST_LOG`，缺省时使用调用方给出的指令；
//! - **契约（What）**：重复调用安全，已有全局订阅器时静默返回 `false`。

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// 安装全局 `fmt` 订阅器。返回本次调用是否真正完成了安装。
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

