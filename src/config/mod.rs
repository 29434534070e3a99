//! Manages application configuration loaded from environment variables.
//!
//! This module defines the `ServerConfig` struct which holds all runtime
//! settings and provides `from_env` to populate it from the environment, or
//! a fluent builder to assemble one programmatically. Defaults mirror
//! spec.md §6; every field is overridable.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

use crate::proxy::ProxyMode;
use crate::wire::DEFAULT_MAX_LINE_LENGTH;

/// Runtime configuration for a `Server`. `Clone` so the acceptor can hand an
/// `Arc<ServerConfig>` to every spawned session without contention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The IP address the SMTP server should listen on. (Optional: `SMTP_BIND_ADDRESS`, Default: "0.0.0.0")
    pub bind_address: String,

    /// The network port the SMTP server should listen on. (Optional: `SMTP_PORT`, Default: 2525)
    pub port: u16,

    /// Name this server identifies itself with in the greeting and HELO/EHLO replies.
    pub hostname: String,

    /// Free-form text appended to the `220` greeting after the hostname.
    pub banner: String,

    /// Maximum number of simultaneously active sessions (Semaphore permits).
    pub max_connections: usize,

    /// Maximum accepted size, in bytes, of a single message body (DATA or the
    /// sum of BDAT chunks).
    pub max_message_size: usize,

    /// Maximum number of RCPT TO recipients accepted per transaction.
    pub max_recipients: usize,

    /// Maximum length, in bytes, of a single command/reply line.
    pub max_line_length: usize,

    /// Whether STARTTLS is advertised and accepted at all.
    pub enable_tls: bool,

    /// Whether MAIL/RCPT/AUTH are refused until STARTTLS has succeeded.
    pub require_tls: bool,

    /// Whether MAIL/RCPT are refused until AUTH has succeeded.
    pub require_auth: bool,

    /// Name given to the Tokio task/thread driving the accept loop, for logs.
    pub server_thread_name: String,

    /// Timeout, in milliseconds, for accepting a new TCP connection's initial
    /// bytes (used to bound the PROXY-preamble probe — see `proxy::dispatch`).
    pub connect_timeout_ms: u64,

    /// Timeout, in milliseconds, a session will wait for the next command
    /// line before closing with `421`.
    pub reply_timeout_ms: u64,

    /// Whether, and how strictly, to expect a PROXY protocol preamble ahead
    /// of the SMTP greeting.
    pub proxy_mode: ProxyMode,

    /// Upper bound on a PROXY v2 header's variable-length address block.
    pub proxy_v2_max_data_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: "0.0.0.0".to_string(),
            port: 2525,
            hostname: "localhost".to_string(),
            banner: "Service ready".to_string(),
            max_connections: 256,
            max_message_size: 25 * 1024 * 1024,
            max_recipients: 100,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            enable_tls: false,
            require_tls: false,
            require_auth: false,
            server_thread_name: "smtp-server".to_string(),
            connect_timeout_ms: 500,
            reply_timeout_ms: 5 * 60 * 1000,
            proxy_mode: ProxyMode::Disabled,
            proxy_v2_max_data_length: 2048,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Loads configuration settings from environment variables, falling
    /// back to `Default` for anything unset. Supports loading from a `.env`
    /// file via `dotenv`, matching the conventions of embedding binaries
    /// that build on this crate.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        let defaults = ServerConfig::default();

        let bind_address = env::var("SMTP_BIND_ADDRESS").unwrap_or(defaults.bind_address);
        log::info!("ServerConfig: using bind_address: {}", bind_address);

        let port = match env::var("SMTP_PORT") {
            Ok(val) => val
                .parse()
                .map_err(|e| anyhow!("SMTP_PORT ('{}') must be a valid u16 port number: {}", val, e))?,
            Err(_) => defaults.port,
        };
        log::info!("ServerConfig: using port: {}", port);

        let hostname = env::var("SMTP_HOSTNAME").unwrap_or(defaults.hostname);

        let max_connections = match env::var("SMTP_MAX_CONNECTIONS") {
            Ok(val) => val
                .parse()
                .map_err(|e| anyhow!("SMTP_MAX_CONNECTIONS must be a valid usize: {}", e))?,
            Err(_) => defaults.max_connections,
        };

        let max_message_size = match env::var("SMTP_MAX_MESSAGE_SIZE") {
            Ok(val) => val
                .parse()
                .map_err(|e| anyhow!("SMTP_MAX_MESSAGE_SIZE must be a valid usize: {}", e))?,
            Err(_) => defaults.max_message_size,
        };

        let enable_tls = match env::var("SMTP_ENABLE_TLS") {
            Ok(val) => val
                .parse()
                .map_err(|e| anyhow!("SMTP_ENABLE_TLS must be true/false: {}", e))?,
            Err(_) => defaults.enable_tls,
        };

        let require_tls = match env::var("SMTP_REQUIRE_TLS") {
            Ok(val) => val
                .parse()
                .map_err(|e| anyhow!("SMTP_REQUIRE_TLS must be true/false: {}", e))?,
            Err(_) => defaults.require_tls,
        };

        let require_auth = match env::var("SMTP_REQUIRE_AUTH") {
            Ok(val) => val
                .parse()
                .map_err(|e| anyhow!("SMTP_REQUIRE_AUTH must be true/false: {}", e))?,
            Err(_) => defaults.require_auth,
        };

        Ok(ServerConfig {
            bind_address,
            port,
            hostname,
            max_connections,
            max_message_size,
            enable_tls,
            require_tls,
            require_auth,
            ..defaults
        })
    }
}

/// Fluent builder for `ServerConfig`. Every setter takes `self` by value so
/// calls chain off of `ServerConfig::builder()`; `build()` consumes the
/// builder and returns the finished config.
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        ServerConfigBuilder {
            config: ServerConfig::default(),
        }
    }
}

macro_rules! builder_setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$name = value;
            self
        }
    };
}

impl ServerConfigBuilder {
    builder_setter!(bind_address, String);
    builder_setter!(port, u16);
    builder_setter!(hostname, String);
    builder_setter!(banner, String);
    builder_setter!(max_connections, usize);
    builder_setter!(max_message_size, usize);
    builder_setter!(max_recipients, usize);
    builder_setter!(max_line_length, usize);
    builder_setter!(enable_tls, bool);
    builder_setter!(require_tls, bool);
    builder_setter!(require_auth, bool);
    builder_setter!(server_thread_name, String);
    builder_setter!(connect_timeout_ms, u64);
    builder_setter!(reply_timeout_ms, u64);
    builder_setter!(proxy_mode, ProxyMode);
    builder_setter!(proxy_v2_max_data_length, usize);

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
