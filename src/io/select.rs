use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token};

use super::{AsyncIo, Driver, IoError, IoEvent};

/// Readiness wait across a set of channels.
pub trait Selector<D: Driver> {
    /// Waits up to `timeout` and returns the indices of ready channels in
    /// ascending order, each at most once.
    fn select(
        &mut self,
        channels: &mut [&mut AsyncIo<D>],
        timeout: Duration,
    ) -> Result<Vec<usize>, IoError>;
}

/// [`Selector`] backed by `mio::Poll`.
///
/// Each call re-registers every active channel under its array index with
/// the interest its state needs, which re-arms the edge-triggered backend so
/// readiness behaves level-triggered from the caller's point of view.
#[derive(Debug)]
pub struct MioSelector {
    poll: Poll,
    events: Events,
}

impl MioSelector {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }

    /// Registry for extra sources, such as a listener, that should wake the
    /// wait. Their tokens must lie outside the channel index range.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }
}

impl<D: Driver> Selector<D> for MioSelector {
    fn select(
        &mut self,
        channels: &mut [&mut AsyncIo<D>],
        timeout: Duration,
    ) -> Result<Vec<usize>, IoError> {
        let registry = self.poll.registry();
        for (index, channel) in channels.iter_mut().enumerate() {
            if let Some(interest) = channel.interest() {
                channel
                    .driver_mut()
                    .register(registry, Token(index), interest)?;
            }
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }

        let mut ready: Vec<usize> = self
            .events
            .iter()
            .map(|event| event.token().0)
            .filter(|index| *index < channels.len())
            .collect();
        ready.sort_unstable();
        ready.dedup();
        Ok(ready)
    }
}

/// Waits once for readiness, then steps each ready channel exactly once.
///
/// Events are returned in channel order, tagged with the channel's index.
pub fn poll_many<D, S>(
    selector: &mut S,
    channels: &mut [&mut AsyncIo<D>],
    timeout: Duration,
) -> Result<Vec<(usize, IoEvent)>, IoError>
where
    D: Driver,
    S: Selector<D>,
{
    let ready = selector.select(channels, timeout)?;
    let mut events = Vec::new();
    for index in ready {
        if let Some(channel) = channels.get_mut(index) {
            if let Some(event) = channel.poll_one() {
                events.push((index, event));
            }
        }
    }
    Ok(events)
}
