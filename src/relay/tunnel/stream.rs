//! Erases the difference between a plain `TcpStream` and a TLS-wrapped
//! stream so the bidirectional copier can treat the public-facing
//! connection and the agent's reverse-dialed connection uniformly.

use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream usable as one half of a relayed connection.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncDuplex for T {}

/// A type-erased connection: either a plain TCP socket or a TLS stream.
pub type BoxedConn = Box<dyn AsyncDuplex>;
