//! Nonblocking retry engine
//!
//! One loop shape shared by the handshake, the write path and the read
//! path: make an attempt, classify the outcome, and either finish, wait for
//! readiness and retry, or stop. The IO primitive is a closure, so the
//! backoff policy can be exercised without a live TLS session.
//!
//! Write chunks and read blocks start large and are halved (down to a
//! floor) every time the channel would block.

use super::error::TlsError;
use super::Result;
use crate::net::Interest;
use bytes::{Bytes, BytesMut};
use openssl::ssl::ErrorCode;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Initial write chunk / read block size
pub const DEFAULT_CHUNK_SIZE: usize = 100 * 1024;

/// Smallest chunk the backoff will shrink to
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Readiness wait between read/write retries
pub const IO_RETRY_WAIT: Duration = Duration::from_millis(10);

/// Readiness wait between handshake retries
pub const HANDSHAKE_RETRY_WAIT: Duration = Duration::from_millis(100);

const ERR_LIB_SSL: libc::c_int = 20;
const SSL_R_UNEXPECTED_EOF_WHILE_READING: libc::c_int = 294;

/// Outcome of a single IO attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// The primitive moved data (or, for the handshake, completed)
    Progress(T),
    /// Retry once the channel is readable
    WouldBlockRead,
    /// Retry once the channel is writable
    WouldBlockWrite,
    /// Peer closed or the pipe broke
    Closed,
    /// TLS protocol failure
    Fatal(openssl::ssl::Error),
    /// Anything else; propagated unchanged
    Other(TlsError),
}

/// Result of a read or write: data, or the closed sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer<T> {
    Done(T),
    Closed,
}

impl<T> Transfer<T> {
    pub fn is_closed(&self) -> bool {
        matches!(self, Transfer::Closed)
    }

    /// The transferred value, `None` for the closed sentinel
    pub fn done(self) -> Option<T> {
        match self {
            Transfer::Done(value) => Some(value),
            Transfer::Closed => None,
        }
    }
}

/// How a handshake drive ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    DeadlineExceeded,
}

/// Something that can wait for readiness between attempts
pub trait Readiness {
    /// Wait up to `timeout` for `interest`. A `false` return is not an
    /// error; the engine simply tries again.
    fn wait_ready(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool>;
}

/// Chunk sizing and wait intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_chunk: usize,
    pub min_chunk: usize,
    pub io_wait: Duration,
    pub handshake_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_chunk: DEFAULT_CHUNK_SIZE,
            min_chunk: MIN_CHUNK_SIZE,
            io_wait: IO_RETRY_WAIT,
            handshake_wait: HANDSHAKE_RETRY_WAIT,
        }
    }
}

/// Per-call retry bookkeeping
#[derive(Debug, Clone, Copy)]
struct RetryState {
    chunk: usize,
    floor: usize,
    total: usize,
    retries: usize,
}

impl RetryState {
    fn new(chunk: usize, floor: usize) -> Self {
        RetryState {
            chunk,
            floor: floor.min(chunk),
            total: 0,
            retries: 0,
        }
    }

    fn backoff(&mut self) {
        self.chunk = (self.chunk / 2).max(self.floor);
        self.retries += 1;
    }
}

fn interest_of<T>(attempt: &Attempt<T>) -> Interest {
    match attempt {
        Attempt::WouldBlockRead => Interest::Read,
        _ => Interest::Write,
    }
}

/// Write all of `data`, retrying partial and would-block attempts.
///
/// Returns the number of bytes the primitive accepted, which equals
/// `data.len()` unless the channel closed. A chunk that would block is
/// resubmitted with at least its original length: record-oriented engines
/// such as OpenSSL reject a shorter retry of a pending write.
pub fn write_all<C, F>(
    policy: &RetryPolicy,
    chan: &mut C,
    data: &[u8],
    mut attempt: F,
) -> Result<Transfer<usize>>
where
    C: Readiness,
    F: FnMut(&mut C, &[u8]) -> Attempt<usize>,
{
    let len = data.len();
    let mut state = RetryState::new(policy.initial_chunk, policy.min_chunk);
    let mut resubmit = 0;

    while state.total < len {
        let size = state.chunk.max(resubmit).min(len - state.total);
        let chunk = &data[state.total..state.total + size];

        match attempt(chan, chunk) {
            Attempt::Progress(0) => {
                debug!(sent = state.total, "write made no progress, treating as closed");
                return Ok(Transfer::Closed);
            }
            Attempt::Progress(n) => {
                state.total += n.min(size);
                resubmit = 0;
            }
            blocked @ (Attempt::WouldBlockRead | Attempt::WouldBlockWrite) => {
                let interest = interest_of(&blocked);
                resubmit = size;
                state.backoff();
                trace!(?interest, chunk = state.chunk, retries = state.retries, "write would block");
                chan.wait_ready(interest, policy.io_wait)?;
            }
            Attempt::Closed => {
                debug!(sent = state.total, "peer closed during write");
                return Ok(Transfer::Closed);
            }
            Attempt::Fatal(e) => {
                debug!(sent = state.total, error = %e, "TLS failure during write");
                return Ok(Transfer::Closed);
            }
            Attempt::Other(e) => return Err(e),
        }
    }

    Ok(Transfer::Done(state.total))
}

/// Read whatever is available, up to `max_len` bytes.
///
/// Returns as soon as any bytes arrive. The request size starts at the
/// policy's chunk size (capped by `max_len`) and shrinks on would-block.
pub fn read_some<C, F>(
    policy: &RetryPolicy,
    chan: &mut C,
    max_len: Option<usize>,
    mut attempt: F,
) -> Result<Transfer<Bytes>>
where
    C: Readiness,
    F: FnMut(&mut C, &mut [u8]) -> Attempt<usize>,
{
    let cap = max_len.unwrap_or(policy.initial_chunk);
    if cap == 0 {
        return Ok(Transfer::Done(Bytes::new()));
    }

    let mut state = RetryState::new(policy.initial_chunk.min(cap), policy.min_chunk);
    let mut buf = BytesMut::zeroed(state.chunk);

    loop {
        match attempt(chan, &mut buf[..state.chunk]) {
            Attempt::Progress(0) => {
                debug!("end of stream");
                return Ok(Transfer::Closed);
            }
            Attempt::Progress(n) => {
                buf.truncate(n.min(state.chunk));
                return Ok(Transfer::Done(buf.freeze()));
            }
            blocked @ (Attempt::WouldBlockRead | Attempt::WouldBlockWrite) => {
                let interest = interest_of(&blocked);
                state.backoff();
                trace!(?interest, block = state.chunk, retries = state.retries, "read would block");
                chan.wait_ready(interest, policy.io_wait)?;
            }
            Attempt::Closed => {
                debug!("peer closed during read");
                return Ok(Transfer::Closed);
            }
            Attempt::Fatal(e) => {
                debug!(error = %e, "TLS failure during read");
                return Ok(Transfer::Closed);
            }
            Attempt::Other(e) => return Err(e),
        }
    }
}

/// Step a handshake until it completes or `deadline` passes.
///
/// Fatal outcomes are handshake failures and propagate as errors; a peer
/// that hangs up mid-handshake surfaces as an unexpected EOF.
pub fn drive_handshake<C, F>(
    policy: &RetryPolicy,
    chan: &mut C,
    deadline: Instant,
    mut step: F,
) -> Result<HandshakeStatus>
where
    C: Readiness,
    F: FnMut(&mut C) -> Attempt<()>,
{
    let mut retries = 0usize;

    loop {
        match step(chan) {
            Attempt::Progress(()) => {
                trace!(retries, "handshake step complete");
                return Ok(HandshakeStatus::Complete);
            }
            blocked @ (Attempt::WouldBlockRead | Attempt::WouldBlockWrite) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(HandshakeStatus::DeadlineExceeded);
                }
                retries += 1;
                let wait = policy.handshake_wait.min(deadline - now);
                chan.wait_ready(interest_of(&blocked), wait)?;
            }
            Attempt::Closed => return Err(handshake_hangup()),
            Attempt::Fatal(e) => return Err(TlsError::Handshake(e)),
            Attempt::Other(e) => return Err(e),
        }
    }
}

/// Whether an IO error means the connection is gone
pub(crate) fn is_closed_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Classify an OpenSSL read/write failure
pub fn classify<T>(err: openssl::ssl::Error) -> Attempt<T> {
    match err.code() {
        ErrorCode::WANT_READ => Attempt::WouldBlockRead,
        ErrorCode::WANT_WRITE => Attempt::WouldBlockWrite,
        ErrorCode::ZERO_RETURN => Attempt::Closed,
        ErrorCode::SYSCALL => match err.io_error().map(|e| e.kind()) {
            // EOF without close_notify
            None => Attempt::Closed,
            Some(kind) if is_closed_kind(kind) => Attempt::Closed,
            Some(io::ErrorKind::WouldBlock) => Attempt::WouldBlockRead,
            Some(_) => match err.into_io_error() {
                Ok(io_err) => Attempt::Other(TlsError::Io(io_err)),
                Err(err) => Attempt::Fatal(err),
            },
        },
        _ => Attempt::Fatal(err),
    }
}

/// Classify an OpenSSL handshake failure. Only would-block is retryable.
pub fn classify_handshake(err: openssl::ssl::Error) -> Attempt<()> {
    match err.code() {
        ErrorCode::WANT_READ => Attempt::WouldBlockRead,
        ErrorCode::WANT_WRITE => Attempt::WouldBlockWrite,
        _ if is_hangup(&err) => Attempt::Closed,
        _ => Attempt::Fatal(err),
    }
}

/// Terminal handshake failure, mapped the same way in every IO mode
pub(crate) fn handshake_error(err: openssl::ssl::Error) -> TlsError {
    if is_hangup(&err) {
        handshake_hangup()
    } else {
        TlsError::Handshake(err)
    }
}

/// Peer went away: clean close, EOF without close_notify, or a dead pipe
fn is_hangup(err: &openssl::ssl::Error) -> bool {
    match err.code() {
        ErrorCode::ZERO_RETURN => true,
        ErrorCode::SYSCALL => err.io_error().map_or(true, |e| is_closed_kind(e.kind())),
        // OpenSSL 3 reports a bare EOF as a protocol error with its own reason
        ErrorCode::SSL => err.ssl_error().map_or(false, |stack| {
            stack.errors().iter().any(|e| {
                e.library_code() == ERR_LIB_SSL && e.reason_code() == SSL_R_UNEXPECTED_EOF_WHILE_READING
            })
        }),
        _ => false,
    }
}

fn handshake_hangup() -> TlsError {
    TlsError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "peer closed connection during handshake",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted channel: records every attempt and wait
    #[derive(Default)]
    struct Script {
        attempts: Vec<usize>,
        waits: Vec<(Interest, Duration)>,
        outcomes: VecDeque<Attempt<usize>>,
        accepted: Vec<u8>,
    }

    impl Script {
        fn with(outcomes: Vec<Attempt<usize>>) -> Self {
            Script {
                outcomes: outcomes.into(),
                ..Default::default()
            }
        }

        fn write(&mut self, chunk: &[u8]) -> Attempt<usize> {
            self.attempts.push(chunk.len());
            match self.outcomes.pop_front() {
                Some(Attempt::Progress(n)) => {
                    let n = n.min(chunk.len());
                    self.accepted.extend_from_slice(&chunk[..n]);
                    Attempt::Progress(n)
                }
                Some(other) => other,
                None => {
                    self.accepted.extend_from_slice(chunk);
                    Attempt::Progress(chunk.len())
                }
            }
        }

        fn read(&mut self, buf: &mut [u8]) -> Attempt<usize> {
            self.attempts.push(buf.len());
            match self.outcomes.pop_front() {
                Some(Attempt::Progress(n)) => {
                    let n = n.min(buf.len());
                    buf[..n].fill(b'x');
                    Attempt::Progress(n)
                }
                Some(other) => other,
                None => Attempt::Closed,
            }
        }
    }

    impl Readiness for Script {
        fn wait_ready(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool> {
            self.waits.push((interest, timeout));
            Ok(true)
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fatal() -> openssl::ssl::Error {
        openssl::ssl::Error::from(openssl::error::ErrorStack::get())
    }

    #[test]
    fn test_write_drains_in_partial_steps() {
        let data = payload(10_000);
        let mut chan = Script::with(vec![Attempt::Progress(3000), Attempt::Progress(3000)]);

        let result = write_all(&RetryPolicy::default(), &mut chan, &data, |c, b| c.write(b)).unwrap();

        assert_eq!(result, Transfer::Done(10_000));
        assert_eq!(chan.accepted, data);
        assert_eq!(chan.attempts, vec![10_000, 7_000, 4_000]);
        assert!(chan.waits.is_empty());
    }

    #[test]
    fn test_write_empty_buffer() {
        let mut chan = Script::default();
        let result = write_all(&RetryPolicy::default(), &mut chan, &[], |c, b| c.write(b)).unwrap();
        assert_eq!(result, Transfer::Done(0));
        assert!(chan.attempts.is_empty());
    }

    #[test]
    fn test_throttled_write_of_250k_shrinks_chunks() {
        let total = 250 * 1024;
        let data = payload(total);

        // Send queue holds 16 KiB per attempt and is full every third try
        let mut outcomes = Vec::new();
        for i in 0..200 {
            if i % 3 == 2 {
                outcomes.push(Attempt::WouldBlockWrite);
            } else {
                outcomes.push(Attempt::Progress(16 * 1024));
            }
        }
        let mut chan = Script::with(outcomes);

        let result = write_all(&RetryPolicy::default(), &mut chan, &data, |c, b| c.write(b)).unwrap();

        assert_eq!(result, Transfer::Done(total));
        assert_eq!(chan.accepted, data);
        assert!(chan.waits.len() > 1);
        assert!(chan.waits.iter().all(|(i, t)| *i == Interest::Write && *t == IO_RETRY_WAIT));

        let smallest = chan.attempts.iter().copied().min().unwrap();
        assert!(smallest < DEFAULT_CHUNK_SIZE);
        let last = *chan.attempts.last().unwrap();
        assert!(chan.attempts.iter().all(|&n| n >= MIN_CHUNK_SIZE || n == last));
    }

    #[test]
    fn test_blocked_chunk_is_resubmitted_whole() {
        let data = payload(200 * 1024);
        let mut chan = Script::with(vec![
            Attempt::WouldBlockWrite,
            Attempt::Progress(DEFAULT_CHUNK_SIZE),
        ]);

        let result = write_all(&RetryPolicy::default(), &mut chan, &data, |c, b| c.write(b)).unwrap();

        assert_eq!(result, Transfer::Done(data.len()));
        // Retry keeps the blocked length, the next fresh chunk is halved
        assert_eq!(chan.attempts[0], DEFAULT_CHUNK_SIZE);
        assert_eq!(chan.attempts[1], DEFAULT_CHUNK_SIZE);
        assert_eq!(chan.attempts[2], DEFAULT_CHUNK_SIZE / 2);
    }

    #[test]
    fn test_write_waits_for_readable_when_engine_wants_read() {
        let policy = RetryPolicy::default();
        let data = payload(4096);
        let mut outcomes: Vec<Attempt<usize>> = (0..20).map(|_| Attempt::WouldBlockRead).collect();
        outcomes.push(Attempt::Progress(4096));
        let mut chan = Script::with(outcomes);

        let result = write_all(&policy, &mut chan, &data, |c, b| c.write(b)).unwrap();

        assert_eq!(result, Transfer::Done(4096));
        assert!(chan.waits.iter().all(|(i, _)| *i == Interest::Read));
    }

    #[test]
    fn test_write_closed_is_sentinel() {
        let data = payload(50_000);
        let mut chan = Script::with(vec![Attempt::Progress(1000), Attempt::Closed]);
        let result = write_all(&RetryPolicy::default(), &mut chan, &data, |c, b| c.write(b)).unwrap();
        assert!(result.is_closed());
    }

    #[test]
    fn test_write_fatal_is_sentinel() {
        let data = payload(10);
        let mut chan = Script::with(vec![Attempt::Fatal(fatal())]);
        let result = write_all(&RetryPolicy::default(), &mut chan, &data, |c, b| c.write(b)).unwrap();
        assert_eq!(result, Transfer::Closed);
    }

    #[test]
    fn test_write_zero_progress_is_sentinel() {
        let data = payload(10);
        let mut chan = Script::with(vec![Attempt::Progress(0)]);
        let result = write_all(&RetryPolicy::default(), &mut chan, &data, |c, b| c.write(b)).unwrap();
        assert_eq!(result, Transfer::Closed);
    }

    #[test]
    fn test_write_other_propagates() {
        let data = payload(10);
        let mut chan = Script::with(vec![Attempt::Other(TlsError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "nope",
        )))]);
        let result = write_all(&RetryPolicy::default(), &mut chan, &data, |c, b| c.write(b));
        assert!(matches!(result, Err(TlsError::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn test_read_returns_available_bytes() {
        let mut chan = Script::with(vec![Attempt::Progress(12)]);
        let result = read_some(&RetryPolicy::default(), &mut chan, Some(4096), |c, b| c.read(b)).unwrap();

        assert_eq!(result, Transfer::Done(Bytes::from(vec![b'x'; 12])));
        assert_eq!(chan.attempts, vec![4096]);
    }

    #[test]
    fn test_read_block_shrinks_on_would_block() {
        let mut chan = Script::with(vec![
            Attempt::WouldBlockRead,
            Attempt::WouldBlockRead,
            Attempt::Progress(5),
        ]);
        let result = read_some(&RetryPolicy::default(), &mut chan, None, |c, b| c.read(b)).unwrap();

        assert_eq!(result.done().unwrap().len(), 5);
        assert_eq!(
            chan.attempts,
            vec![DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_SIZE / 2, DEFAULT_CHUNK_SIZE / 4]
        );
        assert_eq!(chan.waits, vec![(Interest::Read, IO_RETRY_WAIT); 2]);
    }

    #[test]
    fn test_read_small_max_len_floor() {
        let mut chan = Script::with(vec![Attempt::WouldBlockRead, Attempt::Progress(100)]);
        let result = read_some(&RetryPolicy::default(), &mut chan, Some(512), |c, b| c.read(b)).unwrap();

        assert_eq!(result.done().unwrap().len(), 100);
        assert_eq!(chan.attempts, vec![512, 512]);
    }

    #[test]
    fn test_read_zero_len() {
        let mut chan = Script::default();
        let result = read_some(&RetryPolicy::default(), &mut chan, Some(0), |c, b| c.read(b)).unwrap();
        assert_eq!(result, Transfer::Done(Bytes::new()));
        assert!(chan.attempts.is_empty());
    }

    #[test]
    fn test_read_closed_and_eof() {
        let mut chan = Script::with(vec![Attempt::Closed]);
        let result = read_some(&RetryPolicy::default(), &mut chan, None, |c, b| c.read(b)).unwrap();
        assert!(result.is_closed());

        let mut chan = Script::with(vec![Attempt::Progress(0)]);
        let result = read_some(&RetryPolicy::default(), &mut chan, None, |c, b| c.read(b)).unwrap();
        assert!(result.is_closed());

        let mut chan = Script::with(vec![Attempt::Fatal(fatal())]);
        let result = read_some(&RetryPolicy::default(), &mut chan, None, |c, b| c.read(b)).unwrap();
        assert!(result.is_closed());
    }

    struct Steps {
        remaining_blocks: usize,
        waits: Vec<Duration>,
    }

    impl Readiness for Steps {
        fn wait_ready(&mut self, _interest: Interest, timeout: Duration) -> io::Result<bool> {
            self.waits.push(timeout);
            Ok(false)
        }
    }

    #[test]
    fn test_handshake_completes_after_retries() {
        let mut chan = Steps { remaining_blocks: 3, waits: Vec::new() };
        let deadline = Instant::now() + Duration::from_secs(5);

        let status = drive_handshake(&RetryPolicy::default(), &mut chan, deadline, |c| {
            if c.remaining_blocks == 0 {
                Attempt::Progress(())
            } else {
                c.remaining_blocks -= 1;
                Attempt::WouldBlockRead
            }
        })
        .unwrap();

        assert_eq!(status, HandshakeStatus::Complete);
        assert_eq!(chan.waits.len(), 3);
        assert!(chan.waits.iter().all(|w| *w <= HANDSHAKE_RETRY_WAIT));
    }

    #[test]
    fn test_handshake_deadline() {
        let mut chan = Steps { remaining_blocks: usize::MAX, waits: Vec::new() };
        let policy = RetryPolicy {
            handshake_wait: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let deadline = Instant::now() + Duration::from_millis(30);

        let status = drive_handshake(&policy, &mut chan, deadline, |_| Attempt::WouldBlockWrite).unwrap();

        assert_eq!(status, HandshakeStatus::DeadlineExceeded);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_handshake_fatal_propagates() {
        let mut chan = Steps { remaining_blocks: 0, waits: Vec::new() };
        let deadline = Instant::now() + Duration::from_secs(1);

        let result = drive_handshake(&RetryPolicy::default(), &mut chan, deadline, |_| {
            Attempt::Fatal(fatal())
        });
        assert!(matches!(result, Err(TlsError::Handshake(_))));

        let result = drive_handshake(&RetryPolicy::default(), &mut chan, deadline, |_| Attempt::Closed);
        assert!(matches!(result, Err(TlsError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_classify_ssl_failure_is_fatal() {
        assert!(matches!(classify::<usize>(fatal()), Attempt::Fatal(_)));
        assert!(matches!(classify_handshake(fatal()), Attempt::Fatal(_)));
        assert!(matches!(handshake_error(fatal()), TlsError::Handshake(_)));
    }

    #[test]
    fn test_closed_kinds() {
        assert!(is_closed_kind(io::ErrorKind::BrokenPipe));
        assert!(is_closed_kind(io::ErrorKind::ConnectionReset));
        assert!(!is_closed_kind(io::ErrorKind::PermissionDenied));
        assert!(!is_closed_kind(io::ErrorKind::WouldBlock));
    }
}
