//! framed-tcp: a length-prefixed framed-message TCP server.
//!
//! The server accepts TCP connections and runs one session per connection.
//! Each session reads frames through a decoder, hands every payload to a
//! user handler, and writes replies queued with `Session::send` back through
//! an encoder.
//!
//! ```text
//! socket -> decoder -> handler -> session.send -> outbound queue -> encoder -> socket
//! ```
//!
//! Features:
//! - Length-field codec with 1, 2 or 4 byte big-endian fields
//! - Per-session codec and handler instances created from factories
//! - Bounded outbound queue as the only backpressure mechanism
//! - Per-frame read timeout as a dead-peer detector
//! - Ordered shutdown: stop accepting, close sessions, wait for their flows

pub mod codec;
pub mod config;
pub mod registry;
pub mod server;
pub mod session;

pub use codec::{
    CodecError, Decoder, Encoder, LenFieldWidth, LengthFieldBasedFrameDecoder,
    LengthFieldPrepender,
};
pub use config::ServerConfig;
pub use registry::SessionRegistry;
pub use server::{Handler, Server, ServerBuilder, ServerError};
pub use session::{Session, SessionError, SessionState};
