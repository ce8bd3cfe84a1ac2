use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;

/// SSH extended data type for stderr
const EXTENDED_DATA_STDERR: u32 = 1;

/// 通道写入接口，负责向单个SSH通道输出
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    /// 发送数据到通道
    async fn send_data(&self, data: &[u8]) -> Result<()>;

    /// 发送扩展数据到通道（通常用于stderr）
    async fn send_extended_data(&self, ext: u32, data: &[u8]) -> Result<()>;

    /// 发送退出状态
    async fn send_exit_status(&self, exit_status: u32) -> Result<()>;

    /// 发送EOF
    async fn send_eof(&self) -> Result<()>;

    /// 关闭通道
    async fn close_channel(&self) -> Result<()>;
}

/// SSH通道写入器实现
pub struct SshChannelWriter {
    handle: Handle,
    channel: ChannelId,
}

impl SshChannelWriter {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait]
impl ChannelWriter for SshChannelWriter {
    async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|e| anyhow::anyhow!("发送数据失败: {:?}", e))
    }

    async fn send_extended_data(&self, ext: u32, data: &[u8]) -> Result<()> {
        self.handle
            .extended_data(self.channel, ext, CryptoVec::from_slice(data))
            .await
            .map_err(|e| anyhow::anyhow!("发送扩展数据失败: {:?}", e))
    }

    async fn send_exit_status(&self, exit_status: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.channel, exit_status)
            .await
            .map_err(|_| anyhow::anyhow!("发送退出状态失败"))
    }

    async fn send_eof(&self) -> Result<()> {
        self.handle
            .eof(self.channel)
            .await
            .map_err(|_| anyhow::anyhow!("发送EOF失败"))
    }

    async fn close_channel(&self) -> Result<()> {
        self.handle
            .close(self.channel)
            .await
            .map_err(|_| anyhow::anyhow!("关闭通道失败"))
    }
}

/// 终端信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyInfo {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// Connection facts gathered by the protocol handler before a session runs.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub id: usize,
    pub user: String,
    pub remote_addr: Option<SocketAddr>,
    /// The exec request exactly as the client sent it
    pub raw_command: Option<String>,
    /// `raw_command` split with shell quoting rules
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub pty: Option<PtyInfo>,
    /// SHA256 fingerprint of the key the client authenticated with
    pub public_key: Option<String>,
}

/// One accepted session as seen by middleware: its arguments, input and output.
pub struct Session {
    info: SessionInfo,
    writer: Arc<dyn ChannelWriter>,
    input: mpsc::UnboundedReceiver<Vec<u8>>,
    exit_status: Option<u32>,
}

impl Session {
    pub fn new(
        info: SessionInfo,
        writer: Arc<dyn ChannelWriter>,
        input: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            info,
            writer,
            input,
            exit_status: None,
        }
    }

    pub fn id(&self) -> usize {
        self.info.id
    }

    pub fn user(&self) -> &str {
        &self.info.user
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.info.remote_addr
    }

    pub fn raw_command(&self) -> Option<&str> {
        self.info.raw_command.as_deref()
    }

    /// Argument vector of the exec request; empty for a shell request.
    pub fn command(&self) -> &[String] {
        &self.info.command
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.info.env.get(key).map(String::as_str)
    }

    pub fn pty(&self) -> Option<&PtyInfo> {
        self.info.pty.as_ref()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.info.public_key.as_deref()
    }

    /// Next chunk of client stdin, `None` after EOF.
    pub async fn read_input(&mut self) -> Option<Vec<u8>> {
        self.input.recv().await
    }

    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.writer.send_data(data.as_ref()).await
    }

    pub async fn write_stderr(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.writer
            .send_extended_data(EXTENDED_DATA_STDERR, data.as_ref())
            .await
    }

    /// Send the exit status and close the channel. Only the first call has
    /// any effect.
    pub async fn exit(&mut self, code: u32) -> Result<()> {
        if self.exit_status.is_some() {
            return Ok(());
        }
        self.exit_status = Some(code);
        self.writer.send_exit_status(code).await?;
        self.writer.send_eof().await?;
        self.writer.close_channel().await
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }
}
