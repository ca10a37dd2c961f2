//! Non-blocking channel engine.
//!
//! An [`AsyncIo`] drives one socket through connect and alternating
//! send/receive cycles. It never blocks: every call to [`AsyncIo::poll_one`]
//! performs at most a couple of non-blocking syscalls and reports what
//! happened as an [`IoEvent`]. Many channels are stepped together by
//! [`poll_many`], the only place the caller may be suspended.
//!
//! # Guarantees
//! - At most one of sending/receiving is active; the single scratch buffer is
//!   never shared between directions.
//! - Every transport error is terminal: the socket is closed and the error is
//!   reported exactly once.
//! - A receive that would fill the scratch buffer fails with
//!   [`IoError::Oversized`] instead of overflowing.

use std::io;
use std::net::SocketAddr;

use mio::Interest;
use thiserror::Error;
use tracing::trace;

pub mod driver;
pub mod select;

pub use driver::{ConnectStatus, Driver, TcpDriver};
pub use select::{poll_many, MioSelector, Selector};

/// Default scratch buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 1200;

/// Non-blocking attempts made per poll step in either direction.
const ATTEMPTS_PER_POLL: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Closed,
    Connecting,
    Sending,
    /// Idle or accumulating inbound bytes.
    Receiving,
    Error,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("channel has no socket")]
    NotConnected,
    #[error("channel busy ({0:?})")]
    Busy(IoState),
    #[error("{len} bytes do not fit the {capacity}-byte channel buffer")]
    Oversized { len: usize, capacity: usize },
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// What a poll step produced.
#[derive(Debug)]
pub enum IoEvent {
    Connected,
    /// The whole pending send has been written.
    Sent(usize),
    Received(Vec<u8>),
    /// The channel failed and its socket has been closed.
    Error(IoError),
}

/// One non-blocking connection and its scratch buffer.
#[derive(Debug)]
pub struct AsyncIo<D> {
    driver: D,
    state: IoState,
    cursor: usize,
    len: usize,
    buf: Box<[u8]>,
}

impl<D: Driver> AsyncIo<D> {
    pub fn new(driver: D, capacity: usize) -> Self {
        let state = if driver.is_open() {
            IoState::Receiving
        } else {
            IoState::Closed
        };
        Self {
            driver,
            state,
            cursor: 0,
            len: 0,
            buf: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Closes any existing socket and starts a new connection.
    ///
    /// `Connected` means the channel is immediately receiving; `Pending`
    /// means [`poll_one`](Self::poll_one) will report [`IoEvent::Connected`]
    /// later. A refused connect leaves the channel in [`IoState::Error`].
    pub fn connect(&mut self, addr: SocketAddr) -> Result<ConnectStatus, IoError> {
        self.close();
        match self.driver.connect(addr) {
            Ok(ConnectStatus::Connected) => {
                self.state = IoState::Receiving;
                Ok(ConnectStatus::Connected)
            }
            Ok(ConnectStatus::Pending) => {
                self.state = IoState::Connecting;
                Ok(ConnectStatus::Pending)
            }
            Err(err) => {
                self.driver.close();
                self.state = IoState::Error;
                Err(err.into())
            }
        }
    }

    /// Queues `data` for transmission on the next poll steps.
    pub fn send(&mut self, data: &[u8]) -> Result<(), IoError> {
        if !self.driver.is_open() {
            return Err(IoError::NotConnected);
        }
        match self.state {
            IoState::Receiving => {}
            other => return Err(IoError::Busy(other)),
        }
        if data.len() > self.buf.len() {
            return Err(IoError::Oversized {
                len: data.len(),
                capacity: self.buf.len(),
            });
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.cursor = 0;
        self.state = IoState::Sending;
        Ok(())
    }

    pub fn close(&mut self) {
        self.driver.close();
        self.state = IoState::Closed;
        self.cursor = 0;
        self.len = 0;
    }

    /// Performs one step of whatever the channel is doing.
    pub fn poll_one(&mut self) -> Option<IoEvent> {
        match self.state {
            IoState::Connecting => self.poll_connect(),
            IoState::Sending => self.poll_send(),
            IoState::Receiving => self.poll_recv(),
            IoState::Closed | IoState::Error => None,
        }
    }

    fn poll_connect(&mut self) -> Option<IoEvent> {
        match self.driver.finish_connect() {
            Ok(true) => {
                self.state = IoState::Receiving;
                Some(IoEvent::Connected)
            }
            Ok(false) => None,
            Err(err) => self.fail(err.into()),
        }
    }

    fn poll_send(&mut self) -> Option<IoEvent> {
        for _ in 0..ATTEMPTS_PER_POLL {
            match self.driver.send(&self.buf[self.cursor..self.len]) {
                Ok(0) => return self.fail(IoError::PeerClosed),
                Ok(n) => {
                    self.cursor += n;
                    trace!(sent = n, cursor = self.cursor, len = self.len, "channel write");
                    if self.cursor >= self.len {
                        let sent = self.len;
                        self.cursor = 0;
                        self.len = 0;
                        self.state = IoState::Receiving;
                        return Some(IoEvent::Sent(sent));
                    }
                }
                Err(err) if would_block(&err) => break,
                Err(err) => return self.fail(err.into()),
            }
        }
        None
    }

    fn poll_recv(&mut self) -> Option<IoEvent> {
        let capacity = self.buf.len();
        let mut got = 0;
        for attempt in 0..ATTEMPTS_PER_POLL {
            match self.driver.recv(&mut self.buf[got..]) {
                Ok(0) if attempt == 0 => return self.fail(IoError::PeerClosed),
                Ok(0) => break,
                Ok(n) => {
                    got += n;
                    if got >= capacity {
                        return self.fail(IoError::Oversized { len: got, capacity });
                    }
                }
                Err(err) if would_block(&err) => break,
                Err(err) => return self.fail(err.into()),
            }
        }
        if got == 0 {
            return None;
        }
        trace!(received = got, "channel read");
        Some(IoEvent::Received(self.buf[..got].to_vec()))
    }

    fn fail(&mut self, err: IoError) -> Option<IoEvent> {
        self.driver.close();
        self.state = IoState::Error;
        self.cursor = 0;
        self.len = 0;
        Some(IoEvent::Error(err))
    }

    /// Readiness the channel is waiting for, if any.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            IoState::Connecting | IoState::Sending => Some(Interest::WRITABLE),
            IoState::Receiving => Some(Interest::READABLE),
            IoState::Closed | IoState::Error => None,
        }
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_open()
    }

    /// Ready to accept a new [`send`](Self::send).
    pub fn is_idle(&self) -> bool {
        self.state == IoState::Receiving
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted driver: each `recv`/`send` pops the next canned result.
    #[derive(Default)]
    struct Script {
        open: bool,
        reads: VecDeque<io::Result<Vec<u8>>>,
        writes: VecDeque<io::Result<usize>>,
        written: Vec<u8>,
        connected: bool,
    }

    impl Driver for Script {
        fn connect(&mut self, _addr: SocketAddr) -> io::Result<ConnectStatus> {
            self.open = true;
            Ok(ConnectStatus::Pending)
        }

        fn finish_connect(&mut self) -> io::Result<bool> {
            Ok(self.connected)
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self
                .writes
                .pop_front()
                .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))?;
            let n = n.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let chunk = self
                .reads
                .pop_front()
                .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))?;
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn open_channel(capacity: usize) -> AsyncIo<Script> {
        AsyncIo::new(
            Script {
                open: true,
                ..Script::default()
            },
            capacity,
        )
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:30303".parse().unwrap()
    }

    #[test]
    fn pending_connect_completes_on_poll() {
        let mut io = AsyncIo::new(Script::default(), 64);
        assert_eq!(io.state(), IoState::Closed);
        assert_eq!(io.connect(addr()).unwrap(), ConnectStatus::Pending);
        assert_eq!(io.state(), IoState::Connecting);
        assert!(io.poll_one().is_none());
        io.driver_mut().connected = true;
        assert!(matches!(io.poll_one(), Some(IoEvent::Connected)));
        assert_eq!(io.state(), IoState::Receiving);
    }

    #[test]
    fn send_without_socket_is_rejected() {
        let mut io = AsyncIo::new(Script::default(), 64);
        assert!(matches!(io.send(b"abc"), Err(IoError::NotConnected)));
    }

    #[test]
    fn send_larger_than_buffer_is_rejected() {
        let mut io = open_channel(4);
        assert!(matches!(
            io.send(b"too long"),
            Err(IoError::Oversized { len: 8, capacity: 4 })
        ));
        assert_eq!(io.state(), IoState::Receiving);
    }

    #[test]
    fn short_writes_advance_cursor() {
        let mut io = open_channel(64);
        io.driver_mut().writes.extend([Ok(2), Ok(2)]);
        io.send(b"abcdef").unwrap();
        assert!(matches!(io.send(b"x"), Err(IoError::Busy(IoState::Sending))));

        assert!(io.poll_one().is_none());
        assert_eq!(io.state(), IoState::Sending);

        io.driver_mut().writes.extend([Ok(2)]);
        assert!(matches!(io.poll_one(), Some(IoEvent::Sent(6))));
        assert_eq!(io.state(), IoState::Receiving);
        assert_eq!(io.driver().written, b"abcdef");
    }

    #[test]
    fn write_error_is_terminal() {
        let mut io = open_channel(64);
        io.driver_mut()
            .writes
            .push_back(Err(io::ErrorKind::BrokenPipe.into()));
        io.send(b"abc").unwrap();
        assert!(matches!(io.poll_one(), Some(IoEvent::Error(IoError::Io(_)))));
        assert_eq!(io.state(), IoState::Error);
        assert!(!io.is_open());
        assert!(io.poll_one().is_none());
    }

    #[test]
    fn reads_accumulate_within_one_poll() {
        let mut io = open_channel(64);
        io.driver_mut()
            .reads
            .extend([Ok(b"hel".to_vec()), Ok(b"lo".to_vec())]);
        match io.poll_one() {
            Some(IoEvent::Received(bytes)) => assert_eq!(bytes, b"hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_read_after_data_is_not_a_disconnect() {
        let mut io = open_channel(64);
        io.driver_mut()
            .reads
            .extend([Ok(b"abc".to_vec()), Ok(Vec::new())]);
        assert!(matches!(io.poll_one(), Some(IoEvent::Received(_))));
        assert_eq!(io.state(), IoState::Receiving);
    }

    #[test]
    fn zero_read_on_first_attempt_means_peer_closed() {
        let mut io = open_channel(64);
        io.driver_mut().reads.push_back(Ok(Vec::new()));
        assert!(matches!(
            io.poll_one(),
            Some(IoEvent::Error(IoError::PeerClosed))
        ));
        assert_eq!(io.state(), IoState::Error);
        assert!(!io.is_open());
    }

    #[test]
    fn receive_filling_buffer_is_oversized() {
        let mut io = open_channel(8);
        io.driver_mut().reads.push_back(Ok(vec![0xaa; 32]));
        assert!(matches!(
            io.poll_one(),
            Some(IoEvent::Error(IoError::Oversized { len: 8, capacity: 8 }))
        ));
        assert_eq!(io.state(), IoState::Error);
        assert!(!io.is_open());
    }

    #[test]
    fn interest_follows_state() {
        let mut io = open_channel(16);
        assert_eq!(io.interest(), Some(Interest::READABLE));
        io.send(b"a").unwrap();
        assert_eq!(io.interest(), Some(Interest::WRITABLE));
        io.close();
        assert_eq!(io.interest(), None);
    }
}
