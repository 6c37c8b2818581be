//! Per-connection session.
//!
//! A session owns one accepted TCP connection and runs two cooperating flows:
//!
//! - the read flow decodes frames and hands each payload to the handler,
//!   in wire order, on the flow itself
//! - the write flow drains the outbound queue, encodes each payload and
//!   writes the whole frame to the socket
//!
//! Both flows watch a shared cancellation token. Whichever flow terminates
//! first (or an external `close`) cancels it, which stops the other flow.
//! The token is idempotent, so any number of terminators may close the
//! session concurrently.
//!
//! ## State Machine
//!
//! ```text
//! New -> Open -> Closing -> Closed
//! ```

use crate::codec::{CodecError, Decoder, Encoder};
use crate::server::Handler;
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Outbound queue capacity used when the configured size is zero.
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 1024;

/// Read buffer in front of the decoder.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Registered, flows not started yet.
    New = 0,
    /// Both flows running.
    Open = 1,
    /// Close requested; flows are winding down.
    Closing = 2,
    /// Both flows have terminated.
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::New,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("outbound queue full")]
    QueueFull,

    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("write error: {0}")]
    Write(io::Error),

    #[error("short write, wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

type Attributes = HashMap<String, Box<dyn Any + Send + Sync>>;

struct Shared {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    state: AtomicU8,
    /// Read timeout in nanoseconds, 0 = disabled.
    read_timeout_ns: AtomicU64,
    attributes: RwLock<Attributes>,
}

/// Handle to a live session.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// The parts of a session that are moved into its flows when it opens.
///
/// Codec and handler instances live here rather than on the shared handle,
/// so each one is owned by exactly one flow of exactly one session.
pub(crate) struct SessionIo {
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
    pub outbound: mpsc::Receiver<Bytes>,
    pub encoder: Box<dyn Encoder>,
    pub decoder: Box<dyn Decoder>,
    pub handler: Box<dyn Handler>,
}

impl Session {
    /// Create a session handle and the receiving end of its outbound queue.
    pub(crate) fn new(
        id: u64,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        send_buffer_size: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let capacity = if send_buffer_size == 0 {
            DEFAULT_SEND_BUFFER_SIZE
        } else {
            send_buffer_size
        };
        let (tx, rx) = mpsc::channel(capacity);

        let session = Session {
            shared: Arc::new(Shared {
                id,
                local_addr,
                remote_addr,
                outbound: tx,
                closed: CancellationToken::new(),
                state: AtomicU8::new(SessionState::New as u8),
                read_timeout_ns: AtomicU64::new(0),
                attributes: RwLock::new(HashMap::new()),
            }),
        };
        (session, rx)
    }

    /// Create a session for an accepted stream.
    pub(crate) fn from_stream(
        id: u64,
        stream: TcpStream,
        send_buffer_size: usize,
        encoder: Box<dyn Encoder>,
        decoder: Box<dyn Decoder>,
        handler: Box<dyn Handler>,
    ) -> io::Result<(Self, SessionIo)> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (session, outbound) = Session::new(id, local_addr, remote_addr, send_buffer_size);
        let (reader, writer) = stream.into_split();

        let io = SessionIo {
            reader,
            writer,
            outbound,
            encoder,
            decoder,
            handler,
        };
        Ok((session, io))
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Wait until the session starts closing.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Per-frame read deadline. `Duration::ZERO` disables it.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_nanos(self.shared.read_timeout_ns.load(Ordering::Relaxed))
    }

    /// Change the read deadline. Takes effect from the next frame.
    pub fn set_read_timeout(&self, timeout: Duration) {
        let ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.shared.read_timeout_ns.store(ns, Ordering::Relaxed);
    }

    /// Queue a payload for the write flow.
    ///
    /// Waits while the outbound queue is full. Fails once the session is
    /// closing instead of waiting forever.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        let payload = payload.into();
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(SessionError::Closed),
            sent = self.shared.outbound.send(payload) => sent.map_err(|_| SessionError::Closed),
        }
    }

    /// Queue a payload without waiting.
    pub fn try_send(&self, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.shared
            .outbound
            .try_send(payload.into())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
            })
    }

    /// Start closing the session. Safe to call any number of times from
    /// any task.
    pub fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        let _ = self.shared.state.compare_exchange(
            SessionState::Open as u8,
            SessionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.shared.state.compare_exchange(
            SessionState::New as u8,
            SessionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shared.closed.cancel();
    }

    /// Store a user attribute, replacing any previous value under `key`.
    pub fn set_attribute<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.shared
            .attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Box::new(value));
    }

    /// Clone out an attribute if present and of type `T`.
    pub fn attribute<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Clone,
    {
        self.shared
            .attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.shared
            .attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Remove an attribute, returning whether it was present.
    pub fn remove_attribute(&self, key: &str) -> bool {
        self.shared
            .attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Move to `Open` and spawn both flows.
    ///
    /// Called exactly once, after registration and after the open callback.
    pub(crate) fn open(&self, io: SessionIo) -> (JoinHandle<()>, JoinHandle<()>) {
        let _ = self.shared.state.compare_exchange(
            SessionState::New as u8,
            SessionState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let SessionIo {
            reader,
            writer,
            outbound,
            encoder,
            decoder,
            handler,
        } = io;

        let read = tokio::spawn(read_flow(self.clone(), reader, decoder, handler));
        let write = tokio::spawn(write_flow(self.clone(), writer, encoder, outbound));
        (read, write)
    }

    /// Record that both flows have terminated.
    pub(crate) fn mark_closed(&self) {
        self.close();
        self.shared
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}

/// Closes the session when a flow exits, including by panic.
struct CloseOnDrop(Session);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

async fn read_flow(
    session: Session,
    reader: OwnedReadHalf,
    mut decoder: Box<dyn Decoder>,
    mut handler: Box<dyn Handler>,
) {
    let _guard = CloseOnDrop(session.clone());
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, reader);

    loop {
        let read_timeout = session.read_timeout();
        let decoded = tokio::select! {
            biased;
            _ = session.closed() => break,
            decoded = read_frame(&session, decoder.as_mut(), &mut reader, read_timeout) => decoded,
        };

        match decoded {
            Ok(payload) => {
                trace!(ssid = session.id(), len = payload.len(), "Decoded message");
                handler.process(&session, payload).await;
            }
            Err(SessionError::Codec(CodecError::UnexpectedEof)) => {
                trace!(ssid = session.id(), "Connection closed by peer");
                break;
            }
            Err(e) => {
                error!(ssid = session.id(), error = %e, "Read message error");
                break;
            }
        }
    }
}

async fn read_frame(
    session: &Session,
    decoder: &mut dyn Decoder,
    reader: &mut BufReader<OwnedReadHalf>,
    read_timeout: Duration,
) -> Result<Bytes, SessionError> {
    if read_timeout.is_zero() {
        return Ok(decoder.decode(session, reader).await?);
    }
    match tokio::time::timeout(read_timeout, decoder.decode(session, reader)).await {
        Ok(decoded) => Ok(decoded?),
        Err(_) => Err(SessionError::ReadTimeout(read_timeout)),
    }
}

async fn write_flow(
    session: Session,
    mut writer: OwnedWriteHalf,
    mut encoder: Box<dyn Encoder>,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    let _guard = CloseOnDrop(session.clone());

    loop {
        let payload = tokio::select! {
            biased;
            _ = session.closed() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        trace!(ssid = session.id(), len = payload.len(), "Encoding message");
        let result = match encoder.encode(&session, &payload) {
            // A peer that stops reading must not pin the flow once closed.
            Ok(frame) => tokio::select! {
                biased;
                _ = session.closed() => {
                    debug!(ssid = session.id(), "Write abandoned, session closed");
                    return;
                }
                written = write_frame(&mut writer, &frame) => written,
            },
            Err(e) => Err(SessionError::Codec(e)),
        };

        match result {
            Ok(()) => {}
            Err(SessionError::Write(e)) if is_peer_closed(&e) => {
                debug!(ssid = session.id(), error = %e, "Write failed, connection closed");
                break;
            }
            Err(e) => {
                error!(ssid = session.id(), error = %e, "Write message error");
                break;
            }
        }
    }

    session.close();
    if let Err(e) = writer.shutdown().await {
        trace!(ssid = session.id(), error = %e, "Shutdown error");
    }
}

/// Write a whole frame. Anything less corrupts the peer's framing, so a
/// zero-length write is fatal.
async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < frame.len() {
        let n = writer
            .write(&frame[written..])
            .await
            .map_err(SessionError::Write)?;
        if n == 0 {
            return Err(SessionError::ShortWrite {
                written,
                expected: frame.len(),
            });
        }
        written += n;
    }
    Ok(())
}

fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;
    use tokio_test::{assert_err, assert_ok};

    fn detached(send_buffer_size: usize) -> (Session, mpsc::Receiver<Bytes>) {
        Session::new(
            7,
            "127.0.0.1:10001".parse().unwrap(),
            "127.0.0.1:54321".parse().unwrap(),
            send_buffer_size,
        )
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let (session, mut rx) = detached(4);
        assert_ok!(session.send(&b"first"[..]).await);
        assert_ok!(session.send(&b"second"[..]).await);

        assert_eq!(&rx.recv().await.unwrap()[..], b"first");
        assert_eq!(&rx.recv().await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn test_try_send_full_queue() {
        let (session, _rx) = detached(1);
        assert_ok!(session.try_send(&b"a"[..]));
        assert!(matches!(
            session.try_send(&b"b"[..]),
            Err(SessionError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_default_queue_capacity() {
        let (session, _rx) = detached(0);
        for _ in 0..DEFAULT_SEND_BUFFER_SIZE {
            assert_ok!(session.try_send(Bytes::new()));
        }
        assert!(matches!(
            session.try_send(Bytes::new()),
            Err(SessionError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_blocked_send_released_by_close() {
        let (session, _rx) = detached(1);
        assert_ok!(session.send(&b"a"[..]).await);

        let sender = session.clone();
        let blocked = tokio::spawn(async move { sender.send(&b"b"[..]).await });
        tokio::task::yield_now().await;
        session.close();

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(SessionError::Closed)));
        assert_err!(session.try_send(&b"c"[..]));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, _rx) = detached(1);
        assert_eq!(session.state(), SessionState::New);
        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Closing);

        session.mark_closed();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_attributes() {
        let (session, _rx) = detached(1);
        assert!(!session.has_attribute("user"));

        session.set_attribute("user", String::from("alice"));
        session.set_attribute("retries", 3u32);
        assert_eq!(session.attribute::<String>("user").as_deref(), Some("alice"));
        assert_eq!(session.attribute::<u32>("retries"), Some(3));
        assert_eq!(session.attribute::<u64>("retries"), None);

        assert!(session.remove_attribute("user"));
        assert!(!session.remove_attribute("user"));
        assert!(!session.has_attribute("user"));
    }

    #[test]
    fn test_read_timeout() {
        let (session, _rx) = detached(1);
        assert!(session.read_timeout().is_zero());
        session.set_read_timeout(Duration::from_secs(10));
        assert_eq!(session.read_timeout(), Duration::from_secs(10));

        // Sub-millisecond deadlines stay enabled.
        session.set_read_timeout(Duration::from_micros(500));
        assert_eq!(session.read_timeout(), Duration::from_micros(500));
        assert!(!session.read_timeout().is_zero());
    }

    /// Accepts nothing, reporting zero bytes written.
    struct StalledWriter;

    impl AsyncWrite for StalledWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Ok(0))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_frame_zero_write() {
        let mut writer = StalledWriter;
        match write_frame(&mut writer, b"\x00\x02ab").await {
            Err(SessionError::ShortWrite { written, expected }) => {
                assert_eq!(written, 0);
                assert_eq!(expected, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_frame_partial_writes() {
        let mut writer = Builder::new()
            .write(b"\x00\x00")
            .write(b"\x00\x03ab")
            .write(b"c")
            .build();
        assert_ok!(write_frame(&mut writer, b"\x00\x00\x00\x03abc").await);
    }

    #[tokio::test]
    async fn test_write_frame_error() {
        let mut writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
            .build();
        match write_frame(&mut writer, b"\x00\x01a").await {
            Err(SessionError::Write(e)) => assert!(is_peer_closed(&e)),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
