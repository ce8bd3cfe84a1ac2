use std::io;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// 触发关闭的进程信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

/// Bridges SIGINT/SIGTERM to a single awaitable notification.
///
/// Handlers are installed in [`TerminationListener::new`], so a signal
/// delivered between construction and the first `recv` is not lost and no
/// longer kills the process.
pub struct TerminationListener {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl TerminationListener {
    #[cfg(unix)]
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next termination signal. Each delivery resolves exactly
    /// one call.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> io::Result<TerminationSignal> {
        tokio::select! {
            _ = self.interrupt.recv() => Ok(TerminationSignal::Interrupt),
            _ = self.terminate.recv() => Ok(TerminationSignal::Terminate),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> io::Result<TerminationSignal> {
        tokio::signal::ctrl_c().await?;
        Ok(TerminationSignal::Interrupt)
    }
}
