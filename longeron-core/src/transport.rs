//! Non-blocking stream transport abstraction.
//!
//! The engine drives a single connected stream (TCP or UNIX domain) through
//! this trait. All calls are non-blocking: `WouldBlock` means "wait for the
//! next readiness callback", `Ok(0)` from `read` means the peer closed.

use crate::options::Options;
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use tracing::debug;

/// A connected, non-blocking, stream-oriented transport.
pub trait Transport {
    /// Read into `buf`. `Ok(0)` = orderly peer close; `WouldBlock` = no
    /// data now.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the bytes accepted by the kernel.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Printable local endpoint, when the transport has one.
    fn local_addr(&self) -> Option<String> {
        None
    }

    /// Printable peer endpoint, when the transport has one.
    fn peer_addr(&self) -> Option<String> {
        None
    }

    /// Effective SO_RCVBUF, used as a lower bound for read batching.
    fn rcvbuf_len(&self) -> Option<usize> {
        None
    }

    /// Effective SO_SNDBUF, used as a lower bound for write batching.
    fn sndbuf_len(&self) -> Option<usize> {
        None
    }
}

/// Whether an IO error is the EAGAIN/EINTR class the caller should retry
/// on the next readiness callback.
#[must_use]
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// TCP transport for a connected peer.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Take ownership of a connected stream, switch it to non-blocking
    /// mode and apply the buffer hints from `options`.
    pub fn new(stream: TcpStream, options: &Options) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let sock = SockRef::from(&stream);
        if options.rcvbuf > 0 {
            sock.set_recv_buffer_size(options.rcvbuf)?;
        }
        if options.sndbuf > 0 {
            sock.set_send_buffer_size(options.sndbuf)?;
        }
        debug!(
            rcvbuf = sock.recv_buffer_size().unwrap_or(0),
            sndbuf = sock.send_buffer_size().unwrap_or(0),
            "tcp transport configured"
        );

        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn local_addr(&self) -> Option<String> {
        self.stream.local_addr().ok().map(|a| format!("tcp://{a}"))
    }

    fn peer_addr(&self) -> Option<String> {
        self.stream.peer_addr().ok().map(|a| format!("tcp://{a}"))
    }

    fn rcvbuf_len(&self) -> Option<usize> {
        SockRef::from(&self.stream).recv_buffer_size().ok()
    }

    fn sndbuf_len(&self) -> Option<usize> {
        SockRef::from(&self.stream).send_buffer_size().ok()
    }
}

/// UNIX domain stream transport.
#[cfg(unix)]
pub struct UnixTransport {
    stream: UnixStream,
}

#[cfg(unix)]
impl UnixTransport {
    pub fn new(stream: UnixStream, options: &Options) -> io::Result<Self> {
        stream.set_nonblocking(true)?;

        let sock = SockRef::from(&stream);
        if options.rcvbuf > 0 {
            sock.set_recv_buffer_size(options.rcvbuf)?;
        }
        if options.sndbuf > 0 {
            sock.set_send_buffer_size(options.sndbuf)?;
        }

        Ok(Self { stream })
    }

    fn addr_string(addr: &std::os::unix::net::SocketAddr) -> Option<String> {
        addr.as_pathname()
            .map(|p| format!("ipc://{}", p.display()))
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn local_addr(&self) -> Option<String> {
        self.stream.local_addr().ok().and_then(|a| Self::addr_string(&a))
    }

    fn peer_addr(&self) -> Option<String> {
        self.stream.peer_addr().ok().and_then(|a| Self::addr_string(&a))
    }

    fn rcvbuf_len(&self) -> Option<usize> {
        SockRef::from(&self.stream).recv_buffer_size().ok()
    }

    fn sndbuf_len(&self) -> Option<usize> {
        SockRef::from(&self.stream).send_buffer_size().ok()
    }
}
