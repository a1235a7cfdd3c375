use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// 从字符串解析日志级别
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Filter directive used when `RUST_LOG` is not set
pub fn default_directive(level: LogLevel) -> String {
    format!("mtproxy_relay={}", level.as_str())
}

/// 初始化日志；`RUST_LOG` 优先
pub fn init_logger(log_level: Option<LogLevel>) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        EnvFilter::new(default_directive(log_level.unwrap_or_default()))
    };

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .try_init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    /// 记录连接事件
    pub fn connection(addr: &str, event: &str) {
        debug!(peer = addr, event = event, "Connection");
    }

    /// 记录握手事件
    pub fn handshake(addr: &str, error: Option<&str>) {
        if let Some(err) = error {
            debug!(peer = addr, error = err, "Handshake failed");
        } else {
            debug!(peer = addr, "Handshake completed");
        }
    }

    /// 记录上游连接事件
    pub fn upstream(addr: &str, upstream: &str, dc: i16, error: Option<&str>) {
        if let Some(err) = error {
            warn!(peer = addr, upstream = upstream, dc = dc, error = err, "Upstream connect failed");
        } else {
            debug!(peer = addr, upstream = upstream, dc = dc, "Upstream connected");
        }
    }
}
