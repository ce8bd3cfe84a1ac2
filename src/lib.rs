pub mod command_handler;
pub mod config;
pub mod error;
pub mod key_manager;
pub mod lifecycle;
pub mod logging;
pub mod middleware;
pub mod session;
pub mod signal;
pub mod ssh_server;

// 导出主要结构和函数以便使用
pub use command_handler::{CommandMiddleware, EchoCommand, SessionCommand};
pub use config::ServerConfig;
pub use error::{ErrorKind, ServerError};
pub use key_manager::KeyManager;
pub use lifecycle::{LifecycleState, Server, ServerHandle};
pub use logging::setup_logging;
pub use middleware::{Chain, LoggingMiddleware, Middleware, Next};
pub use session::Session;
pub use signal::{TerminationListener, TerminationSignal};
pub use ssh_server::SshServer;
