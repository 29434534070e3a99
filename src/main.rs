//! Demo binary: runs the SMTP server with a trivial message handler that
//! logs the envelope and accepts everything. Exists to exercise the library
//! as a real embedder would, not as a production mail gateway.

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};

use smtp_server::{AcceptAllHandler, MessageEnvelope, MessageHandler, Server, ServerConfig};

/// Logs the envelope and always accepts. A real embedder supplies its own
/// `MessageHandler` — this one exists only so the demo binary does
/// something visible.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle_message(&self, envelope: MessageEnvelope) -> smtp_server::wire::Reply {
        info!(
            "accepted message from {:?} to {:?} ({} bytes)",
            envelope.from,
            envelope.recipients,
            envelope.data.len()
        );
        smtp_server::wire::Reply::new(250, "OK")
    }
}

#[tokio::main]
async fn main() {
    tracing_log::LogTracer::init().expect("installing the log-to-tracing bridge");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let handler: Arc<dyn MessageHandler> = if std::env::var("SMTP_LOG_MESSAGES").is_ok() {
        Arc::new(LoggingHandler)
    } else {
        Arc::new(AcceptAllHandler)
    };

    let server = Server::new(config, handler);
    let handle = match server.spawn().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to start SMTP server: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("listening on {}", handle.local_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
    }
    info!("received ctrl-c, shutting down");
    handle.shutdown().await;
}
