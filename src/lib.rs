//! An embeddable SMTP server.
//!
//! Accepts inbound TCP connections, optionally strips a PROXY-protocol
//! preamble (v1 or v2), drives an RFC 5321 SMTP session, optionally upgrades
//! to TLS via STARTTLS, and delivers received messages to a host-supplied
//! [`MessageHandler`]. See [`client`] for a minimal blocking test client that
//! pins the wire contract this server satisfies.

pub mod acceptor;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod proxy;
pub mod session;
pub mod tls;
pub mod transport;
pub mod wire;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::net::TcpListener;

pub use config::ServerConfig;
pub use handler::{AcceptAllHandler, AuthenticationHandler, MessageEnvelope, MessageHandler};
pub use lifecycle::ServerHandle;
pub use tls::{ClientAuth, RustlsSocketFactory, SocketFactory};

/// Builds and spawns the SMTP accept loop. Unlike a plain `run()` entry
/// point, this type separates construction (which can fail, e.g. bad TLS
/// material) from spawning (which is infallible once bound).
pub struct Server {
    config: Arc<ServerConfig>,
    message_handler: Arc<dyn MessageHandler>,
    auth_handler: Option<Arc<dyn AuthenticationHandler>>,
    tls_factory: Option<Arc<dyn SocketFactory>>,
}

impl Server {
    pub fn new(config: ServerConfig, message_handler: Arc<dyn MessageHandler>) -> Self {
        Server {
            config: Arc::new(config),
            message_handler,
            auth_handler: None,
            tls_factory: None,
        }
    }

    pub fn with_auth_handler(mut self, handler: Arc<dyn AuthenticationHandler>) -> Self {
        self.auth_handler = Some(handler);
        self
    }

    pub fn with_tls_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.tls_factory = Some(factory);
        self
    }

    /// Binds the listening socket and spawns the accept loop as a Tokio
    /// task, returning a [`ServerHandle`] for graceful shutdown.
    pub async fn spawn(self) -> Result<ServerHandle> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind SMTP listener on {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("SMTP server listening on {}", local_addr);

        if self.config.enable_tls && self.tls_factory.is_none() {
            anyhow::bail!("ServerConfig::enable_tls is set but no TLS socket factory was supplied");
        }
        let tls_factory = if self.config.enable_tls { self.tls_factory } else { None };

        let acceptor = acceptor::Acceptor::new(
            listener,
            self.config,
            self.message_handler,
            self.auth_handler,
            tls_factory,
        );
        let registry = acceptor.registry();
        let shutting_down = acceptor.shutdown_flag();
        let shutdown_notify = acceptor.shutdown_notify();
        let task_tracker = acceptor.task_tracker();

        let accept_task = tokio::spawn(acceptor.run());

        Ok(ServerHandle {
            local_addr,
            registry,
            shutting_down,
            shutdown_notify,
            task_tracker,
            accept_task,
        })
    }
}
