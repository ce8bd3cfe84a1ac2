//! Per-session middleware.
//!
//! A [`Chain`] is an ordered list of [`Middleware`]. The first entry is the
//! outermost: it sees the session first and decides whether to hand it on
//! through [`Next::run`].

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::session::Session;

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handle the session and optionally continue with `next`.
    async fn handle(&self, session: &mut Session, next: Next<'_>) -> Result<()>;
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, session: &mut Session) -> Result<()> {
        match self.rest.split_first() {
            Some((current, rest)) => current.handle(session, Next { rest }).await,
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it runs inside every one added before it.
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn run(&self, session: &mut Session) -> Result<()> {
        Next {
            rest: &self.middlewares,
        }
        .run(session)
        .await
    }
}

/// 记录会话的连接和断开
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, session: &mut Session, next: Next<'_>) -> Result<()> {
        let started = Instant::now();
        let remote_addr = session
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        info!(
            session_id = session.id(),
            user = %session.user(),
            remote_addr = %remote_addr,
            public_key = session.public_key().unwrap_or("-"),
            command = ?session.command(),
            pty = session.pty().is_some(),
            term = session.pty().map(|p| p.term.as_str()).unwrap_or(""),
            "connect"
        );

        let result = next.run(session).await;

        info!(
            session_id = session.id(),
            user = %session.user(),
            remote_addr = %remote_addr,
            elapsed = ?started.elapsed(),
            "disconnect"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::session::test_support::{session_with_args, Output};

    /// Records its name, then continues unless told to stop.
    struct Probe {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        stop: bool,
    }

    #[async_trait]
    impl Middleware for Probe {
        async fn handle(&self, session: &mut Session, next: Next<'_>) -> Result<()> {
            self.seen.lock().unwrap().push(self.name);
            if self.stop {
                return session.exit(3).await;
            }
            next.run(session).await
        }
    }

    fn probe(name: &'static str, seen: &Arc<Mutex<Vec<&'static str>>>, stop: bool) -> Probe {
        Probe {
            name,
            seen: seen.clone(),
            stop,
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(probe("first", &seen, false))
            .with(probe("second", &seen, false))
            .with(probe("third", &seen, false));
        let (mut session, _writer, _tx) = session_with_args(&[]);

        chain.run(&mut session).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(chain.len(), 3);
    }

    #[tokio::test]
    async fn test_middleware_can_stop_the_chain() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(probe("first", &seen, true))
            .with(probe("second", &seen, false));
        let (mut session, writer, _tx) = session_with_args(&[]);

        chain.run(&mut session).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["first"]);
        assert_eq!(writer.events()[0], Output::ExitStatus(3));
    }

    #[tokio::test]
    async fn test_empty_chain_is_noop() {
        let chain = Chain::new();
        let (mut session, writer, _tx) = session_with_args(&["x"]);
        chain.run(&mut session).await.unwrap();
        assert!(chain.is_empty());
        assert!(writer.events().is_empty());
    }

    #[tokio::test]
    async fn test_logging_middleware_continues() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(LoggingMiddleware)
            .with(probe("inner", &seen, false));
        let (mut session, _writer, _tx) = session_with_args(&["hello"]);

        chain.run(&mut session).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["inner"]);
    }
}
