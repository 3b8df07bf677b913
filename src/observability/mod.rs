//! 可观测性：tracing 日志初始化
//!
//! 日志一律写 stderr，stdout 只留给终态的 FINAL_ANSWER 行。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，verbose 每加一级放宽一档（debug / trace），RUST_LOG 优先
pub fn init(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
