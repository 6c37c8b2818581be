//! framed-tcp demo server.
//!
//! Runs a length-field echo server: every decoded payload is sent back to
//! the peer in a frame of the same shape. Stops gracefully on Ctrl-C.

use async_trait::async_trait;
use bytes::Bytes;
use framed_tcp::config::Config;
use framed_tcp::{Handler, Server, Session};
use std::backtrace::Backtrace;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Replies to every payload with the payload itself.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn process(&mut self, session: &Session, payload: Bytes) {
        if let Err(e) = session.send(payload).await {
            debug!(ssid = session.id(), error = %e, "Echo dropped");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Session flows run on spawned tasks; log panics with their stack.
    std::panic::set_hook(Box::new(|panic| {
        let backtrace = Backtrace::force_capture();
        error!(panic = %panic, backtrace = %backtrace, "Panic");
    }));

    info!(
        listen = %config.listen,
        len_field_width = config.codec.len_field_width,
        max_frame_len = config.codec.max_frame_len,
        read_timeout_sec = config.server.read_timeout_sec,
        max_connections = config.server.max_connections,
        "Starting framed-tcp echo server"
    );

    let server = Server::builder(config.listen.clone(), config.server.clone())
        .length_field_codec(config.codec.len_field_width, config.codec.max_frame_len)?
        .handler(|| EchoHandler)
        .on_session_open(|session| {
            info!(ssid = session.id(), peer = %session.remote_addr(), "Session opened");
        })
        .on_session_close(|session| {
            info!(ssid = session.id(), peer = %session.remote_addr(), "Session closed");
        })
        .init()
        .await?;

    let runner = server.clone();
    let accept = tokio::spawn(async move { runner.start().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.stop().await;

    accept.await??;
    Ok(())
}
