//! Control socket transport.
//!
//! One [`Connection`] per transaction: the request is written in full, then
//! the same stream is read (and, for credential prompts, written) until the
//! daemon closes it. There is no reconnect and no timeout; a caller that
//! needs either wraps the [`Connector`].

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{ConnectFailure, Result, WhackError};

/// Longest path that fits in `sockaddr_un.sun_path` with its terminator.
pub const MAX_SOCKET_PATH: usize = 107;

/// Opens the byte stream a transaction runs over.
///
/// [`UnixConnector`] is the real implementation; tests substitute in-memory
/// streams.
pub trait Connector {
    type Stream: Read + Write;

    fn connect(&self, path: &Path) -> Result<Connection<Self::Stream>>;
}

/// Connects to a Unix stream socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixConnector;

impl Connector for UnixConnector {
    type Stream = UnixStream;

    fn connect(&self, path: &Path) -> Result<Connection<UnixStream>> {
        if path.as_os_str().len() > MAX_SOCKET_PATH {
            return Err(WhackError::Connect {
                path: path.to_path_buf(),
                reason: ConnectFailure::PathTooLong,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("socket path exceeds {MAX_SOCKET_PATH} bytes"),
                ),
            });
        }

        let stream = UnixStream::connect(path).map_err(|e| WhackError::Connect {
            path: path.to_path_buf(),
            reason: classify_connect_error(&e),
            source: e,
        })?;
        debug!(path = %path.display(), "connected to control socket");
        Ok(Connection::new(stream))
    }
}

fn classify_connect_error(err: &io::Error) -> ConnectFailure {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ConnectFailure::PermissionDenied,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => ConnectFailure::NoListener,
        io::ErrorKind::InvalidInput => ConnectFailure::PathTooLong,
        _ => ConnectFailure::Other,
    }
}

/// A bidirectional byte stream to the daemon.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Write every byte of `bytes` or fail; never a silent partial write.
    pub fn send_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        trace!(len = bytes.len(), "sent");
        Ok(())
    }

    /// Read at most `buf.len()` bytes. `Ok(0)` means the peer closed.
    pub fn recv_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}
