//! 可观测性：tracing 日志初始化
//!
//! 默认级别由调用方给出（info / debug），RUST_LOG 设置时以 RUST_LOG 为准。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_level("info");
}

pub fn init_with_level(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // 重复初始化（例如测试中）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
