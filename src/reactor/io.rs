use std::{collections::HashMap, io, os::fd::RawFd, time::Duration};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use rustix::io::Errno;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// What the engine wants to hear about for one of its sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketInterest {
    pub readable: bool,
    pub writable: bool,
}

impl SocketInterest {
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
    };
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
    };

    fn to_mio(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Readiness reported for a handle by a single wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    const READABLE: u8 = 1;
    const WRITABLE: u8 = 2;
    const ERROR: u8 = 4;

    pub fn new(readable: bool, writable: bool, error: bool) -> Self {
        let mut bits = 0;
        bits |= (readable as u8) * Self::READABLE;
        bits |= (writable as u8) * Self::WRITABLE;
        bits |= (error as u8) * Self::ERROR;
        Readiness(bits)
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READABLE != 0
    }
    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE != 0
    }
    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR != 0
    }
}

// a closed half still has to be driven so the engine sees the EOF
impl From<&mio::event::Event> for Readiness {
    fn from(e: &mio::event::Event) -> Self {
        Readiness::new(
            e.is_readable() || e.is_read_closed(),
            e.is_writable() || e.is_write_closed(),
            e.is_error(),
        )
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

/// The readiness multiplexer: one poll instance plus the table of sockets
/// the engine asked to watch.
///
/// Timers are registered once with [`Multiplexer::watch_timer`] and never
/// appear in the table.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    watched: HashMap<RawFd, SocketInterest>,
}

impl Multiplexer {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            poll: Poll::new().map_err(Error::os("epoll create"))?,
            events: Events::with_capacity(capacity),
            watched: HashMap::new(),
        })
    }

    pub(crate) fn watch_timer(&self, fd: RawFd) -> Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token(fd), Interest::READABLE)
            .map_err(Error::os("epoll add timer"))
    }

    /// Replaces the registration of `fd`. An empty interest only removes it.
    pub fn register(&mut self, fd: RawFd, interest: SocketInterest) -> Result<()> {
        self.unregister(fd)?;

        let Some(mio_interest) = interest.to_mio() else {
            return Ok(());
        };
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token(fd), mio_interest)
            .map_err(Error::os("epoll add"))?;
        self.watched.insert(fd, interest);
        Ok(())
    }

    /// Removes `fd` from the poll. A handle that was never added is only worth a warning.
    ///
    /// The engine may report a socket gone after it already closed it. Closing
    /// drops the fd from epoll, so a bad descriptor is only worth a warning too.
    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        let was_watched = self.watched.remove(&fd).is_some();
        match self.poll.registry().deregister(&mut SourceFd(&fd)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(fd, "epoll del: fd not found");
                Ok(())
            }
            Err(e) if fd >= 0 && Errno::from_io_error(&e) == Some(Errno::BADF) => {
                warn!(fd, was_watched, "epoll del: fd already closed");
                Ok(())
            }
            Err(e) => Err(Error::Os {
                op: "epoll del",
                source: e,
            }),
        }
    }

    pub fn interest(&self, fd: RawFd) -> Option<SocketInterest> {
        self.watched.get(&fd).copied()
    }

    pub fn watched(&self) -> usize {
        self.watched.len()
    }

    /// Blocks until at least one handle is ready, or `timeout` passes.
    ///
    /// Events come back in the order the poll delivered them.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Readiness)>> {
        let Self { poll, events, .. } = self;
        loop {
            match poll.poll(events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    trace!("epoll wait interrupted, retrying");
                }
                Err(e) => {
                    return Err(Error::Os {
                        op: "epoll wait",
                        source: e,
                    })
                }
            }
        }

        Ok(events
            .iter()
            .map(|event| (event.token().0 as RawFd, event.into()))
            .collect())
    }
}
