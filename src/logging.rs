//! 日志系统模块，提供统一的日志初始化

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// 日志系统初始化函数
///
/// # 参数
/// * `default_level` - 默认日志级别
/// * `app_name` - 应用名称, 用于环境变量前缀
///
/// `<APP>_LOG` overrides the filter, `<APP>_JSON` switches to JSON lines.
///
/// # 示例
/// ```
/// use ssh_echo::setup_logging;
///
/// setup_logging(tracing::Level::INFO, "SSH_ECHO");
/// ```
pub fn setup_logging(default_level: Level, app_name: &str) {
    INIT.call_once(|| {
        let env_name = format!("{}_LOG", app_name);
        let default_directive = level_directive(default_level);

        let filter = EnvFilter::try_from_env(env_name).unwrap_or_else(|_| {
            EnvFilter::new(format!("{},ssh_echo={}", default_directive, default_directive))
        });

        // russh 使用 log crate，必须先初始化 LogTracer
        if tracing_log::LogTracer::init().is_err() {
            return;
        }

        if std::env::var(format!("{}_JSON", app_name)).is_ok() {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .ok();
        }

        tracing::debug!(
            "日志系统初始化完成 [{} {}]",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
    });
}

fn level_directive(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging() {
        // 只确保重复调用不会 panic
        setup_logging(Level::DEBUG, "TEST");
        setup_logging(Level::INFO, "TEST");
        tracing::debug!("测试日志记录");
    }

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive(Level::WARN), "warn");
        assert_eq!(level_directive(Level::TRACE), "trace");
    }
}
