use std::path::PathBuf;
use std::time::Duration;

/// SSH Server Configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to listen on
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Path to the server's host key, generated on first start if missing
    pub host_key_path: PathBuf,
    /// 关闭时等待现有会话结束的最长时间
    pub shutdown_timeout: Duration,
    /// 会话空闲超时，None 表示不限制
    pub idle_timeout: Option<Duration>,
}

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 23235;
pub const DEFAULT_HOST_KEY_PATH: &str = ".ssh/term_info_ed25519";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            host_key_path: PathBuf::from(DEFAULT_HOST_KEY_PATH),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            idle_timeout: Some(Duration::from_secs(3600)),
        }
    }
}

impl ServerConfig {
    /// `host:port` form used for binding and logging
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
