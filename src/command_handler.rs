use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;
use clap::{CommandFactory, Parser};
use tracing::{debug, warn};

use crate::middleware::{Middleware, Next};
use crate::session::Session;

/// 会话命令接口: 由会话参数解析得到，并针对会话执行
#[async_trait]
pub trait SessionCommand: Parser + Send + Sync + 'static {
    async fn run(self, session: &mut Session) -> Result<()>;
}

/// Parses the session's argument vector as `C` and runs it before the rest
/// of the chain.
///
/// Parse errors and command failures go to stderr and exit the session with
/// status 1 without continuing. `--help` goes to stdout and continues.
pub struct CommandMiddleware<C> {
    _command: PhantomData<fn() -> C>,
}

impl<C> CommandMiddleware<C> {
    pub fn new() -> Self {
        Self {
            _command: PhantomData,
        }
    }
}

impl<C> Default for CommandMiddleware<C> {
    fn default() -> Self {
        Self::new()
    }
}

enum Parsed<C> {
    Command(C),
    Help(String),
    Invalid(String),
}

fn parse<C: SessionCommand>(args: &[String]) -> Parsed<C> {
    let name = C::command().get_name().to_string();
    let argv = std::iter::once(name).chain(args.iter().cloned());
    match C::try_parse_from(argv) {
        Ok(command) => Parsed::Command(command),
        Err(e) if !e.use_stderr() => Parsed::Help(e.render().to_string()),
        Err(e) => Parsed::Invalid(e.render().to_string()),
    }
}

#[async_trait]
impl<C: SessionCommand> Middleware for CommandMiddleware<C> {
    async fn handle(&self, session: &mut Session, next: Next<'_>) -> Result<()> {
        match parse::<C>(session.command()) {
            Parsed::Command(command) => {
                if let Err(e) = command.run(session).await {
                    warn!(session_id = session.id(), error = %e, "命令执行失败");
                    session.write_stderr(format!("Error: {:#}\n", e)).await?;
                    return session.exit(1).await;
                }
            }
            Parsed::Help(text) => {
                session.write(text).await?;
            }
            Parsed::Invalid(text) => {
                debug!(session_id = session.id(), command = ?session.command(), "无效的命令参数");
                session.write_stderr(text).await?;
                return session.exit(1).await;
            }
        }

        next.run(session).await
    }
}

/// Echo a string back to the session
#[derive(Parser, Debug)]
#[command(name = "echo", about = "Echo a string back to the session")]
pub struct EchoCommand {
    /// String to echo
    string: String,

    /// Reverse string on echo
    #[arg(short, long)]
    reverse: bool,
}

#[async_trait]
impl SessionCommand for EchoCommand {
    async fn run(self, session: &mut Session) -> Result<()> {
        let text = if self.reverse {
            reverse(&self.string)
        } else {
            self.string
        };
        session.write(format!("{}\n", text)).await
    }
}

/// Reverses by `char` so the output stays valid UTF-8.
pub fn reverse(s: &str) -> String {
    s.chars().rev().collect()
}
