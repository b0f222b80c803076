//! Byte-stream transport seam
//!
//! The TLS layer never opens sockets itself. It is handed an already
//! connected transport and drives it through the [`Transport`] trait:
//! plain read/write, readiness polling, blocking-mode toggles and close.
//!
//! `std::net::TcpStream` implements the trait out of the box.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Readiness interest for [`Transport::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// An already-connected byte stream
pub trait Transport: Read + Write {
    /// Wait until the stream is ready for `interest` or `timeout` elapses.
    ///
    /// Returns `true` if the stream became ready.
    fn wait(&self, interest: Interest, timeout: Duration) -> io::Result<bool>;

    /// Switch between blocking and nonblocking IO
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Bound every blocking read/write by `timeout` (`None` = unbounded)
    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Address of the remote end
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Close both directions of the stream
    fn close(&mut self) -> io::Result<()>;
}

/// Poll a raw file descriptor for a single interest
pub(crate) fn poll_fd(fd: libc::c_int, interest: Interest, timeout: Duration) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match interest {
            Interest::Read => POLLIN,
            Interest::Write => POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        // A signal cut the wait short; the caller will simply retry.
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(result > 0)
}

impl Transport for TcpStream {
    fn wait(&self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        poll_fd(self.as_raw_fd(), interest, timeout)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            // Peer already tore the connection down
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Transport whose blocking IO is bounded by an absolute deadline.
///
/// While a deadline is set, every read and write first re-arms the IO
/// timeout with the time remaining, so a peer trickling bytes cannot
/// stretch the total past it. Past the deadline IO fails with `TimedOut`
/// without touching the stream.
#[derive(Debug)]
pub(crate) struct Bounded<T> {
    inner: T,
    deadline: Option<Instant>,
}

impl<T: Transport> Bounded<T> {
    pub(crate) fn new(inner: T) -> Self {
        Bounded { inner, deadline: None }
    }

    /// Set or clear the deadline. Clearing also lifts the IO timeout.
    pub(crate) fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadline = deadline;
        match deadline {
            Some(_) => Ok(()),
            None => self.inner.set_io_timeout(None),
        }
    }

    pub(crate) fn get_ref(&self) -> &T {
        &self.inner
    }

    fn arm(&self) -> io::Result<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline passed"));
        }
        self.inner.set_io_timeout(Some(remaining))
    }
}

impl<T: Transport> Read for Bounded<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.arm()?;
        self.inner.read(buf)
    }
}

impl<T: Transport> Write for Bounded<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.arm()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T: Transport> Transport for Bounded<T> {
    fn wait(&self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        self.inner.wait(interest, timeout)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }

    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_io_timeout(timeout)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Open a TCP connection with a connect deadline.
///
/// Convenience for callers that do not bring their own transport.
/// Nagle is disabled since TLS records are already coalesced.
pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&SockAddr::from(addr), timeout)?;
    socket.set_nodelay(true)?;
    Ok(socket.into())
}
