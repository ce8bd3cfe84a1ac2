use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use russh::client;
use russh::keys::ssh_key::PublicKey;
use russh::ChannelMsg;
use tokio::time::timeout;
use tracing_subscriber::fmt::MakeWriter;

use ssh_echo::{
    Chain, CommandMiddleware, EchoCommand, LifecycleState, LoggingMiddleware, Server,
    ServerConfig, TerminationListener, TerminationSignal,
};

/// Collects formatted log output in memory.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn echo_server(dir: &tempfile::TempDir) -> Server {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        host_key_path: dir.path().join("term_info_ed25519"),
        ..ServerConfig::default()
    };
    Server::new(
        config,
        Chain::new()
            .with(LoggingMiddleware)
            .with(CommandMiddleware::<EchoCommand>::new()),
    )
}

#[tokio::test]
async fn test_sigterm_triggers_graceful_shutdown() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempfile::tempdir().unwrap();
    let server = echo_server(&dir);
    let mut signals = TerminationListener::new().unwrap();
    let mut handle = server.start().await.unwrap();

    // 信号到达前不会返回
    assert!(timeout(Duration::from_millis(100), signals.recv()).await.is_err());

    nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGTERM).unwrap();
    let signal = timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("signal was not delivered")
        .unwrap();
    assert_eq!(signal, TerminationSignal::Terminate);

    let grace = Duration::from_secs(30);
    let started = Instant::now();
    handle.shutdown(grace).await.unwrap();
    assert!(started.elapsed() < grace);
    assert_eq!(server.state(), LifecycleState::Stopped);

    // 一次信号只唤醒一次
    assert!(timeout(Duration::from_millis(100), signals.recv()).await.is_err());

    let output = logs.contents();
    assert_eq!(output.matches("Starting SSH server").count(), 1, "{output}");
    assert_eq!(output.matches("Stopping SSH server").count(), 1, "{output}");
    let starting = output.find("Starting SSH server").unwrap();
    let stopping = output.find("Stopping SSH server").unwrap();
    assert!(starting < stopping);
}

struct TestClient;

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct ExecOutput {
    stdout: String,
    stderr: String,
    exit_status: Option<u32>,
}

async fn exec(addr: SocketAddr, command: &str) -> Result<ExecOutput> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, addr, TestClient).await?;
    let _ = session.authenticate_none("tester").await?;

    let mut channel = session.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        exit_status,
    })
}

#[tokio::test]
async fn test_echo_over_ssh() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = echo_server(&dir);
    let mut handle = server.start().await?;

    let plain = exec(handle.local_addr(), "hello").await?;
    assert_eq!(plain.stdout, "hello\n");
    assert_eq!(plain.exit_status, Some(0));

    let reversed = exec(handle.local_addr(), "--reverse 'hello world'").await?;
    assert_eq!(reversed.stdout, "dlrow olleh\n");
    assert_eq!(reversed.exit_status, Some(0));

    handle.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test]
async fn test_invalid_arguments_exit_non_zero() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = echo_server(&dir);
    let mut handle = server.start().await?;

    let output = exec(handle.local_addr(), "").await?;
    assert_eq!(output.exit_status, Some(1));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.contains("required"), "{}", output.stderr);

    // 单个会话失败不影响服务器
    assert_eq!(handle.state(), LifecycleState::Serving);
    let ok = exec(handle.local_addr(), "-r abc").await?;
    assert_eq!(ok.stdout, "cba\n");

    handle.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
