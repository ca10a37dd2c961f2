use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

/// Outcome of a non-blocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    Pending,
}

/// Socket operations an [`AsyncIo`](super::AsyncIo) channel is driven through.
///
/// Every call must be non-blocking: "no progress" is reported as
/// `io::ErrorKind::WouldBlock`, never by parking the thread.
pub trait Driver {
    fn connect(&mut self, addr: SocketAddr) -> io::Result<ConnectStatus>;

    /// `Ok(true)` once a pending connect has completed.
    fn finish_connect(&mut self) -> io::Result<bool>;

    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Hooks the socket into a readiness registry. Drivers without an OS
    /// handle keep the default no-op.
    fn register(
        &mut self,
        _registry: &Registry,
        _token: Token,
        _interest: Interest,
    ) -> io::Result<()> {
        Ok(())
    }
}

/// [`Driver`] over a non-blocking `mio` TCP stream.
#[derive(Debug, Default)]
pub struct TcpDriver {
    stream: Option<TcpStream>,
    registered: bool,
}

impl TcpDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a stream returned by a listener's `accept`.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            registered: false,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Driver for TcpDriver {
    fn connect(&mut self, addr: SocketAddr) -> io::Result<ConnectStatus> {
        self.close();
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(ConnectStatus::Pending)
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        let stream = self.stream()?;
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(err)
                if err.kind() == io::ErrorKind::NotConnected
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.registered = false;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        let registered = self.registered;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if registered {
            registry.reregister(stream, token, interest)
        } else {
            registry.register(stream, token, interest)?;
            self.registered = true;
            Ok(())
        }
    }
}
