use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};

use ssh_echo::config::{DEFAULT_HOST, DEFAULT_HOST_KEY_PATH, DEFAULT_PORT};
use ssh_echo::{
    setup_logging, Chain, CommandMiddleware, EchoCommand, LoggingMiddleware, Server,
    ServerConfig, TerminationListener,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "SSH 服务器，向连接的会话提供 echo 命令", long_about = None)]
struct Args {
    /// 监听主机
    #[clap(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// 监听端口
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// 主机密钥路径，不存在时自动生成
    #[clap(short = 'k', long, default_value = DEFAULT_HOST_KEY_PATH)]
    host_key: PathBuf,

    /// 关闭时等待会话结束的秒数
    #[clap(long, default_value_t = 30)]
    shutdown_timeout: u64,

    /// 日志级别 (trace, debug, info, warn, error)
    #[clap(long, default_value = "info")]
    log_level: Level,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            host_key_path: self.host_key,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.log_level, "SSH_ECHO");

    let config = args.into_config();
    let shutdown_timeout = config.shutdown_timeout;

    // 最外层先执行: 先记录连接，再运行命令
    let chain = Chain::new()
        .with(LoggingMiddleware)
        .with(CommandMiddleware::<EchoCommand>::new());

    let mut signals = TerminationListener::new()?;
    let server = Server::new(config, chain);

    // 失败已在 start 内记录
    let mut handle = server.start().await?;

    let signal = signals.recv().await?;
    info!(signal = ?signal, "收到终止信号");

    // 超时同样已记录，进程照常退出
    let _ = handle.shutdown(shutdown_timeout).await;

    Ok(())
}
