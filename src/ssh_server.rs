use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::server::{self, Auth, Msg};
use russh::{Channel, ChannelId, ChannelMsg, Pty};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::middleware::Chain;
use crate::session::{PtyInfo, Session, SessionInfo, SshChannelWriter};

/// Per-connection SSH protocol handler.
///
/// The instance handed to the accept loop acts as a factory: every
/// `new_client` call derives a handler with a fresh id and empty connection
/// state.
pub struct SshServer {
    /// 会话中间件链，所有连接共享
    chain: Arc<Chain>,
    /// 会话ID生成器
    next_id: Arc<AtomicUsize>,
    /// 当前处理器所属的连接ID
    id: usize,
    peer_addr: Option<SocketAddr>,
    /// 认证通过的用户名
    user: Option<String>,
    public_key: Option<String>,
    pty: Option<PtyInfo>,
    env: HashMap<String, String>,
    /// 已打开但尚未开始执行的会话通道
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SshServer {
    pub fn new(chain: Chain) -> Self {
        SshServer {
            chain: Arc::new(chain),
            next_id: Arc::new(AtomicUsize::new(0)),
            id: 0,
            peer_addr: None,
            user: None,
            public_key: None,
            pty: None,
            env: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Hand the channel to a new task that runs the middleware chain and
    /// then exits the session if no middleware did.
    fn start_session(
        &mut self,
        channel_id: ChannelId,
        raw_command: Option<String>,
        command: Vec<String>,
        handle: server::Handle,
    ) -> bool {
        let Some(mut channel) = self.channels.remove(&channel_id) else {
            error!(session_id = self.id, channel_id = ?channel_id, "找不到对应的通道");
            return false;
        };

        let info = SessionInfo {
            id: self.id,
            user: self.user.clone().unwrap_or_default(),
            remote_addr: self.peer_addr,
            raw_command,
            command,
            env: self.env.clone(),
            pty: self.pty.clone(),
            public_key: self.public_key.clone(),
        };

        // 持续读取通道，客户端输入转入会话的 stdin
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut input_tx = Some(input_tx);
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        if let Some(tx) = &input_tx {
                            let _ = tx.send(data.to_vec());
                        }
                    }
                    ChannelMsg::Eof => input_tx = None,
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        });

        let chain = self.chain.clone();
        let writer = Arc::new(SshChannelWriter::new(handle, channel_id));
        tokio::spawn(async move {
            let mut session = Session::new(info, writer, input_rx);
            let code = match chain.run(&mut session).await {
                Ok(()) => 0,
                Err(e) => {
                    error!(session_id = session.id(), error = %e, "会话处理失败");
                    1
                }
            };
            if let Err(e) = session.exit(code).await {
                debug!(session_id = session.id(), error = %e, "关闭会话失败");
            }
        });

        true
    }
}

impl server::Server for SshServer {
    type Handler = Self;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        let client_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let handler = SshServer {
            chain: self.chain.clone(),
            next_id: self.next_id.clone(),
            id: client_id,
            peer_addr,
            user: None,
            public_key: None,
            pty: None,
            env: HashMap::new(),
            channels: HashMap::new(),
        };

        debug!(client_id = client_id, peer_addr = ?peer_addr, "新客户端连接");
        handler
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        warn!(session_id = self.id, error = %error, "会话错误");
    }
}

impl server::Handler for SshServer {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        info!(session_id = self.id, username = %user, auth_type = "none", "用户认证通过");
        self.user = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        warn!(session_id = self.id, username = %user, auth_type = "password", "不支持密码认证");
        Ok(Auth::reject())
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
        info!(
            session_id = self.id,
            username = %user,
            auth_type = "publickey",
            fingerprint = %fingerprint,
            "用户认证通过"
        );
        self.user = Some(user.to_string());
        self.public_key = Some(fingerprint);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        debug!(session_id = self.id, channel_id = ?channel.id(), "会话通道已打开");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        debug!(terminal = %term, cols = col_width, rows = row_height, "收到终端请求");
        self.pty = Some(PtyInfo {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        match &mut self.pty {
            Some(pty) => {
                pty.cols = col_width;
                pty.rows = row_height;
                session.channel_success(channel)?;
            }
            None => {
                warn!(session_id = self.id, "尝试更新PTY大小，但会话没有PTY信息");
                session.channel_failure(channel)?;
            }
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        self.env
            .insert(variable_name.to_string(), variable_value.to_string());
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        debug!(session_id = self.id, "收到 shell 请求");
        if self.start_session(channel, None, Vec::new(), session.handle()) {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).to_string();
        debug!(session_id = self.id, command = %raw, "收到执行命令请求");

        let Some(args) = shlex::split(&raw) else {
            warn!(session_id = self.id, command = %raw, "命令引号不匹配");
            session.channel_failure(channel)?;
            return Ok(());
        };

        if self.start_session(channel, Some(raw), args, session.handle()) {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        warn!(session_id = self.id, subsystem = %name, "不支持的子系统请求");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        debug!(session_id = self.id, channel_id = ?channel, "客户端关闭通道");
        self.channels.remove(&channel);
        Ok(())
    }
}
