#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;

use rlpx::io::ConnectStatus;
use rlpx::{Driver, KeyPair, NodeIdentity, Session, SessionConfig, SessionEvent};

/// Largest chunk a single `recv` hands out, like a TCP segment.
pub const SEGMENT: usize = 512;

#[derive(Default)]
struct Wire {
    /// Bytes waiting to be read by side 0 and side 1.
    queues: [VecDeque<u8>; 2],
    open: [bool; 2],
}

/// Shared handle on both directions of an in-memory connection.
#[derive(Clone, Default)]
pub struct Pipe {
    wire: Rc<RefCell<Wire>>,
}

/// One end of a [`Pipe`].
pub struct PipeDriver {
    wire: Rc<RefCell<Wire>>,
    side: usize,
    segment: usize,
}

impl Pipe {
    /// Returns the dialling end (closed until `connect`) and the accepted end.
    pub fn pair() -> (Pipe, PipeDriver, PipeDriver) {
        let pipe = Pipe::default();
        pipe.wire.borrow_mut().open[1] = true;
        let dialer = PipeDriver {
            wire: pipe.wire.clone(),
            side: 0,
            segment: SEGMENT,
        };
        let acceptor = PipeDriver {
            wire: pipe.wire.clone(),
            side: 1,
            segment: SEGMENT,
        };
        (pipe, dialer, acceptor)
    }

    /// Bytes in flight towards `side`.
    pub fn pending(&self, side: usize) -> usize {
        self.wire.borrow().queues[side].len()
    }

    /// Flips one bit of the bytes in flight towards `side`.
    pub fn flip(&self, side: usize, index: usize) {
        let mut wire = self.wire.borrow_mut();
        if let Some(byte) = wire.queues[side].get_mut(index) {
            *byte ^= 0x01;
        }
    }

    /// Appends raw bytes to what `side` will read next.
    pub fn inject(&self, side: usize, bytes: &[u8]) {
        self.wire.borrow_mut().queues[side].extend(bytes.iter().copied());
    }

    pub fn is_open(&self, side: usize) -> bool {
        self.wire.borrow().open[side]
    }
}

impl PipeDriver {
    pub fn with_segment(mut self, segment: usize) -> Self {
        self.segment = segment;
        self
    }
}

impl Driver for PipeDriver {
    fn connect(&mut self, _addr: SocketAddr) -> io::Result<ConnectStatus> {
        self.wire.borrow_mut().open[self.side] = true;
        Ok(ConnectStatus::Connected)
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        if !wire.open[self.side] {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let other = 1 - self.side;
        if !wire.open[other] {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        wire.queues[other].extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        if !wire.open[self.side] {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if wire.queues[self.side].is_empty() {
            return if wire.open[1 - self.side] {
                Err(io::ErrorKind::WouldBlock.into())
            } else {
                Ok(0)
            };
        }
        let queue = &mut wire.queues[self.side];
        let n = queue.len().min(buf.len()).min(self.segment);
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) {
        let mut wire = self.wire.borrow_mut();
        wire.open[self.side] = false;
        wire.queues[self.side].clear();
    }

    fn is_open(&self) -> bool {
        self.wire.borrow().open[self.side]
    }
}

/// Alice dials Bob over a fresh pipe.
pub struct Peers {
    pub pipe: Pipe,
    pub alice: Session<PipeDriver>,
    pub bob: Session<PipeDriver>,
    pub alice_key: KeyPair,
    pub bob_key: KeyPair,
    pub alice_events: Vec<SessionEvent>,
    pub bob_events: Vec<SessionEvent>,
}

pub fn address() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 30303)
}

impl Peers {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_segment(config, SEGMENT)
    }

    /// Like [`Peers::new`], with reads handing out up to `segment` bytes.
    pub fn with_segment(config: SessionConfig, segment: usize) -> Self {
        let (pipe, dialer, acceptor) = Pipe::pair();
        let (dialer, acceptor) = (dialer.with_segment(segment), acceptor.with_segment(segment));
        let alice_key = KeyPair::random();
        let bob_key = KeyPair::random();
        let alice = Session::new(alice_key.clone(), config.clone(), dialer);
        let bob = Session::accepted(bob_key.clone(), config, acceptor);
        Self {
            pipe,
            alice,
            bob,
            alice_key,
            bob_key,
            alice_events: Vec::new(),
            bob_events: Vec::new(),
        }
    }

    pub fn connect(&mut self) {
        let target = NodeIdentity::new(self.bob_key.id(), Some(address()));
        let events = self.alice.connect(&target).unwrap();
        self.alice_events.extend(events);
    }

    /// Steps both sessions `rounds` times.
    pub fn pump(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.alice_events.extend(self.alice.poll_once());
            self.bob_events.extend(self.bob.poll_once());
        }
    }

    /// Steps until both sides are ready; panics if that never happens.
    pub fn until_ready(&mut self) {
        for _ in 0..200 {
            if self.alice.is_ready() && self.bob.is_ready() {
                return;
            }
            self.pump(1);
        }
        panic!(
            "sessions never became ready: alice {:?} {:?}, bob {:?} {:?}",
            self.alice.state(),
            self.alice_events,
            self.bob.state(),
            self.bob_events
        );
    }

    /// Steps until `done` holds or `rounds` run out; returns rounds used.
    pub fn pump_until(&mut self, rounds: usize, done: impl Fn(&Self) -> bool) -> Option<usize> {
        for round in 0..rounds {
            if done(self) {
                return Some(round);
            }
            self.pump(1);
        }
        done(self).then_some(rounds)
    }
}

pub fn failed(events: &[SessionEvent]) -> bool {
    events.iter().any(|event| matches!(event, SessionEvent::Failed(_)))
}

pub fn became_ready(events: &[SessionEvent]) -> bool {
    events.iter().any(|event| matches!(event, SessionEvent::Ready(_)))
}
