//! Mock control daemon.
//!
//! [`MockDaemon`] listens on a real Unix socket in a temp directory and plays
//! one scripted [`Exchange`] per accepted connection: it reads the request,
//! then writes replies and reads credential answers in script order, then
//! closes. Everything it received is returned as [`Session`]s.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tempfile::TempDir;

/// How long the daemon waits for a client before giving up.
const ACCEPT_DEADLINE: Duration = Duration::from_secs(5);

/// Silence that marks the end of a request.
const REQUEST_QUIET: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum Step {
    Reply(Vec<u8>),
    ReadCredential(usize),
}

/// The daemon's half of one transaction.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    steps: Vec<Step>,
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `bytes` to the client.
    pub fn reply(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Reply(bytes.as_ref().to_vec()));
        self
    }

    /// Read exactly `len` bytes of credential answer from the client.
    pub fn read_credential(mut self, len: usize) -> Self {
        self.steps.push(Step::ReadCredential(len));
        self
    }
}

/// What the daemon received on one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// The packed request message.
    pub request: Vec<u8>,
    /// Each credential answer, in order.
    pub credentials: Vec<Vec<u8>>,
}

impl Session {
    /// Operation flags of the request (they follow the 4-byte magic).
    pub fn ops(&self) -> u16 {
        u16::from_ne_bytes([self.request[4], self.request[5]])
    }
}

/// A scripted daemon bound to `<tempdir>/pluto.ctl`.
pub struct MockDaemon {
    path: PathBuf,
    handle: Option<JoinHandle<io::Result<Vec<Session>>>>,
    _temp_dir: TempDir,
}

impl MockDaemon {
    /// Bind the socket and serve `exchanges`, one connection each.
    pub fn start(exchanges: Vec<Exchange>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("pluto.ctl");
        let listener = UnixListener::bind(&path).expect("failed to bind mock daemon socket");
        listener
            .set_nonblocking(true)
            .expect("failed to make listener non-blocking");

        let handle = std::thread::spawn(move || serve(listener, exchanges));
        Self {
            path,
            handle: Some(handle),
            _temp_dir: temp_dir,
        }
    }

    /// Convenience for a single transaction.
    pub fn once(exchange: Exchange) -> Self {
        Self::start(vec![exchange])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the script to finish and return what was received.
    ///
    /// Connections that never arrived within the accept deadline are
    /// missing from the result.
    pub fn finish(mut self) -> Vec<Session> {
        self.handle
            .take()
            .expect("mock daemon already finished")
            .join()
            .expect("mock daemon thread panicked")
            .expect("mock daemon I/O failed")
    }
}

fn serve(listener: UnixListener, exchanges: Vec<Exchange>) -> io::Result<Vec<Session>> {
    let mut sessions = Vec::new();
    for exchange in exchanges {
        let Some(stream) = accept_within(&listener, ACCEPT_DEADLINE)? else {
            break;
        };
        sessions.push(play(stream, &exchange)?);
    }
    Ok(sessions)
}

fn accept_within(listener: &UnixListener, deadline: Duration) -> io::Result<Option<UnixStream>> {
    let start = Instant::now();
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(Some(stream));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if start.elapsed() > deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e),
        }
    }
}

fn play(mut stream: UnixStream, exchange: &Exchange) -> io::Result<Session> {
    let mut session = Session {
        request: read_request(&mut stream)?,
        ..Default::default()
    };

    stream.set_read_timeout(Some(ACCEPT_DEADLINE))?;
    for step in &exchange.steps {
        match step {
            Step::Reply(bytes) => stream.write_all(bytes)?,
            Step::ReadCredential(len) => {
                let mut buf = vec![0u8; *len];
                stream.read_exact(&mut buf)?;
                session.credentials.push(buf);
            }
        }
    }
    // dropping the stream closes the connection
    Ok(session)
}

/// Read until the client has been quiet for a moment; the client sends its
/// request in one go and then waits for replies.
fn read_request(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let mut request = Vec::new();
    let mut buf = [0u8; 8192];

    stream.set_read_timeout(Some(ACCEPT_DEADLINE))?;
    let n = stream.read(&mut buf)?;
    request.extend_from_slice(&buf[..n]);

    stream.set_read_timeout(Some(REQUEST_QUIET))?;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => request.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(request)
}
