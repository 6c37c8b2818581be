//! TCP server for framed-message connections.
//!
//! Accepts connections, applies per-socket options, creates a session for
//! each one and supervises its flows until they finish.
//!
//! ## Lifecycle
//!
//! 1. `Server::builder(..)` collects codec and handler factories plus the
//!    optional open/close callbacks.
//! 2. `init` resolves the IPv4 address and binds the listener.
//! 3. `start` runs the accept loop until `stop` (or a listener error).
//! 4. `stop` ends the accept loop first, then closes every session and waits
//!    for all of their flows.

use crate::codec::{
    CodecError, Decoder, Encoder, LenFieldWidth, LengthFieldBasedFrameDecoder,
    LengthFieldPrepender,
};
use crate::config::ServerConfig;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionIo};
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pending-connection backlog for the listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Application logic for one session.
///
/// `process` runs on the session's read flow, once per decoded frame, in
/// wire order. No further frames are read until it returns, so it must not
/// block indefinitely. Replies go through `Session::send`.
#[async_trait]
pub trait Handler: Send {
    async fn process(&mut self, session: &Session, payload: Bytes);
}

pub type EncoderFactory = Arc<dyn Fn() -> Box<dyn Encoder> + Send + Sync>;
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;
pub type SessionCallback = Arc<dyn Fn(&Session) + Send + Sync>;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no {0} factory installed")]
    MissingFactory(&'static str),

    #[error("failed to resolve '{addr}': {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("failed to listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("server not initialized or already started")]
    NotInitialized,

    #[error("accept failed: {0}")]
    Accept(io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Factories and callbacks shared by every session.
struct Hooks {
    encoder: EncoderFactory,
    decoder: DecoderFactory,
    handler: HandlerFactory,
    on_session_open: Option<SessionCallback>,
    on_session_close: Option<SessionCallback>,
}

impl Hooks {
    fn session_opened(&self, session: &Session) {
        invoke_callback(self.on_session_open.as_ref(), session, "on_session_open");
    }

    fn session_closed(&self, session: &Session) {
        invoke_callback(self.on_session_close.as_ref(), session, "on_session_close");
    }
}

fn invoke_callback(callback: Option<&SessionCallback>, session: &Session, name: &'static str) {
    let Some(callback) = callback else {
        return;
    };
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(session))) {
        error!(
            ssid = session.id(),
            callback = name,
            panic = panic_message(&*panic),
            "Session callback panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Builder for a [`Server`].
pub struct ServerBuilder {
    addr: String,
    config: ServerConfig,
    encoder: Option<EncoderFactory>,
    decoder: Option<DecoderFactory>,
    handler: Option<HandlerFactory>,
    on_session_open: Option<SessionCallback>,
    on_session_close: Option<SessionCallback>,
}

impl ServerBuilder {
    /// Install the factory producing each session's encoder.
    pub fn encoder<F, E>(mut self, factory: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: Encoder + 'static,
    {
        self.encoder = Some(Arc::new(move || Box::new(factory()) as Box<dyn Encoder>));
        self
    }

    /// Install the factory producing each session's decoder.
    pub fn decoder<F, D>(mut self, factory: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: Decoder + 'static,
    {
        self.decoder = Some(Arc::new(move || Box::new(factory()) as Box<dyn Decoder>));
        self
    }

    /// Install the factory producing each session's handler.
    pub fn handler<F, H>(mut self, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        self.handler = Some(Arc::new(move || Box::new(factory()) as Box<dyn Handler>));
        self
    }

    /// Use length-field framing in both directions.
    pub fn length_field_codec(self, width: usize, max_frame_len: usize) -> Result<Self, ServerError> {
        let width = LenFieldWidth::try_from(width)?;
        Ok(self
            .encoder(move || LengthFieldPrepender::with_width(width))
            .decoder(move || LengthFieldBasedFrameDecoder::with_width(width, max_frame_len)))
    }

    pub fn on_session_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.on_session_open = Some(Arc::new(callback));
        self
    }

    pub fn on_session_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.on_session_close = Some(Arc::new(callback));
        self
    }

    /// Resolve the address and bind the listener.
    pub async fn init(self) -> Result<Arc<Server>, ServerError> {
        let hooks = Hooks {
            encoder: self.encoder.ok_or(ServerError::MissingFactory("encoder"))?,
            decoder: self.decoder.ok_or(ServerError::MissingFactory("decoder"))?,
            handler: self.handler.ok_or(ServerError::MissingFactory("handler"))?,
            on_session_open: self.on_session_open,
            on_session_close: self.on_session_close,
        };

        let addr = resolve_ipv4(&self.addr).await?;
        let listener = create_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(addr = %self.addr, local_addr = %local_addr, "TCP server listening");

        Ok(Arc::new(Server {
            local_addr,
            config: self.config,
            hooks: Arc::new(hooks),
            listener: Mutex::new(Some(listener)),
            shutdown: CancellationToken::new(),
            accept_loop: TaskTracker::new(),
            session_flows: TaskTracker::new(),
            registry: Arc::new(SessionRegistry::new()),
        }))
    }
}

/// Framed-message TCP server.
pub struct Server {
    local_addr: SocketAddr,
    config: ServerConfig,
    hooks: Arc<Hooks>,
    /// Taken by the accept loop; dropping it closes the listening socket.
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
    accept_loop: TaskTracker,
    session_flows: TaskTracker,
    registry: Arc<SessionRegistry>,
}

impl Server {
    pub fn builder(addr: impl Into<String>, config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            addr: addr.into(),
            config,
            encoder: None,
            decoder: None,
            handler: None,
            on_session_open: None,
            on_session_close: None,
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self, id: u64) -> Option<Session> {
        self.registry.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.registry.sessions()
    }

    /// Run the accept loop until `stop` is called or the listener fails.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.accept_loop
            .track_future(async {
                match self.take_listener() {
                    Some(listener) => self.accept_connections(listener).await,
                    None => Err(ServerError::NotInitialized),
                }
            })
            .await
    }

    /// Stop accepting, close every session and wait for their flows.
    pub async fn stop(&self) {
        info!(local_addr = %self.local_addr, "Stopping TCP server");

        self.shutdown.cancel();
        drop(self.take_listener());
        self.accept_loop.close();
        self.accept_loop.wait().await;

        let closed = self.registry.close_all();
        debug!(sessions = closed, "Closed all sessions");

        self.session_flows.close();
        self.session_flows.wait().await;

        info!("TCP server stopped");
    }

    fn take_listener(&self) -> Option<TcpListener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn accept_connections(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Listener closed");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        return Err(ServerError::Accept(e));
                    }
                },
            };

            let max_connections = self.config.max_connections;
            if max_connections > 0 && self.registry.count() >= max_connections {
                warn!(peer = %peer, max_connections, "Connection limit reached");
                continue;
            }

            if let Err(e) = self.configure_socket(&stream) {
                error!(peer = %peer, error = %e, "Failed to configure socket");
                continue;
            }

            self.bind_session(stream, peer);
        }
    }

    fn configure_socket(&self, stream: &TcpStream) -> io::Result<()> {
        let socket = SockRef::from(stream);
        if self.config.keep_alive && self.config.keep_alive_period_sec > 0 {
            let period = Duration::from_secs(self.config.keep_alive_period_sec);
            let keepalive = TcpKeepalive::new()
                .with_time(period)
                .with_interval(period);
            socket.set_tcp_keepalive(&keepalive)?;
        } else {
            socket.set_keepalive(self.config.keep_alive)?;
        }
        stream.set_nodelay(self.config.no_delay)
    }

    fn bind_session(&self, stream: TcpStream, peer: SocketAddr) {
        let encoder = (self.hooks.encoder)();
        let decoder = (self.hooks.decoder)();
        let handler = (self.hooks.handler)();
        let send_buffer_size = self.config.send_buffer_size;

        let registered = self.registry.register(|id| {
            Session::from_stream(id, stream, send_buffer_size, encoder, decoder, handler)
                .map(|(session, io)| (session.clone(), (session, io)))
        });

        let (session, io) = match registered {
            Some(Ok(parts)) => parts,
            Some(Err(e)) => {
                error!(peer = %peer, error = %e, "Failed to create session");
                return;
            }
            None => {
                debug!(peer = %peer, "Server stopping, dropping connection");
                return;
            }
        };

        session.set_read_timeout(Duration::from_secs(self.config.read_timeout_sec));
        debug!(ssid = session.id(), peer = %peer, "Session registered");

        self.session_flows.spawn(run_session(
            session,
            io,
            Arc::clone(&self.registry),
            Arc::clone(&self.hooks),
        ));
    }
}

/// Open a session, wait for both of its flows, then retire it.
async fn run_session(
    session: Session,
    io: SessionIo,
    registry: Arc<SessionRegistry>,
    hooks: Arc<Hooks>,
) {
    hooks.session_opened(&session);

    let (read, write) = session.open(io);
    report_flow(&session, "read", read.await);
    report_flow(&session, "write", write.await);

    session.mark_closed();
    registry.unregister(session.id());
    debug!(ssid = session.id(), peer = %session.remote_addr(), "Session closed");

    hooks.session_closed(&session);
}

/// Log how a flow ended. Only the panic message is available here; a stack
/// trace needs a panic hook such as the one the demo binary installs.
fn report_flow(session: &Session, flow: &'static str, joined: Result<(), JoinError>) {
    let Err(e) = joined else {
        return;
    };
    if e.is_panic() {
        let panic = e.into_panic();
        error!(
            ssid = session.id(),
            flow,
            panic = panic_message(&*panic),
            "Session flow panicked"
        );
    } else {
        debug!(ssid = session.id(), flow, "Session flow cancelled");
    }
    session.close();
}

/// Resolve to the first IPv4 address. `:port` means every interface.
async fn resolve_ipv4(addr: &str) -> Result<SocketAddr, ServerError> {
    let target = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    let mut resolved = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|source| ServerError::Resolve {
            addr: addr.to_string(),
            source,
        })?;

    resolved
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ServerError::Resolve {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no IPv4 address"),
        })
}

/// Create an IPv4 listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}
