//! 日志初始化：`RUST_LOG` 优先，否则使用默认过滤规则。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

/// 初始化 tracing 日志订阅。
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(build_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
