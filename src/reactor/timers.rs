use std::{
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    time::Duration,
};

use rustix::{
    io::Errno,
    time::{
        timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags,
        TimerfdTimerFlags, Timespec,
    },
};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// When a timer should next fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Disarm,
    /// Fire as soon as possible. A zero `it_value` would disarm a timerfd,
    /// so this arms the smallest positive delay instead.
    Immediate,
    After(Duration),
}

impl Deadline {
    /// Engine style millisecond deadline: negative disarms, zero fires immediately.
    pub fn from_millis(ms: i64) -> Self {
        match u64::try_from(ms) {
            Err(_) => Deadline::Disarm,
            Ok(0) => Deadline::Immediate,
            Ok(ms) => Deadline::After(Duration::from_millis(ms)),
        }
    }

    /// The `it_value` handed to the kernel. Zero only for [`Deadline::Disarm`].
    pub fn delay(self) -> Duration {
        match self {
            Deadline::Disarm => Duration::ZERO,
            Deadline::Immediate => Duration::from_nanos(1),
            Deadline::After(d) if d.is_zero() => Duration::from_nanos(1),
            Deadline::After(d) => d,
        }
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Deadline::Disarm,
            Some(d) if d.is_zero() => Deadline::Immediate,
            Some(d) => Deadline::After(d),
        }
    }
}

fn timespec(d: Duration) -> Timespec {
    Timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    }
}

/// A one-shot monotonic timerfd. Becomes readable on the multiplexer when it fires.
#[derive(Debug)]
pub struct Timer {
    name: &'static str,
    fd: OwnedFd,
    armed: bool,
}

impl Timer {
    pub fn new(name: &'static str) -> Result<Self> {
        let fd = timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::NONBLOCK | TimerfdFlags::CLOEXEC,
        )
        .map_err(io::Error::from)
        .map_err(Error::os("timerfd create"))?;
        Ok(Self {
            name,
            fd,
            armed: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Armed and not yet acknowledged.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Replaces whatever deadline was set before. Arming also resets the
    /// expiration count, so a fire that was never acknowledged is dropped.
    pub fn arm(&mut self, deadline: Deadline) -> Result<()> {
        trace!(timer = self.name, ?deadline, "arming timer");
        let spec = Itimerspec {
            it_interval: timespec(Duration::ZERO),
            it_value: timespec(deadline.delay()),
        };
        timerfd_settime(&self.fd, TimerfdTimerFlags::empty(), &spec)
            .map_err(io::Error::from)
            .map_err(Error::os("timerfd settime"))?;
        self.armed = deadline != Deadline::Disarm;
        Ok(())
    }

    /// Reads and discards the expiration count.
    ///
    /// Returns how many expirations were pending; zero if the read would block.
    pub fn acknowledge(&mut self) -> Result<u64> {
        let mut count = [0u8; 8];
        match rustix::io::read(&self.fd, &mut count) {
            Ok(_) => {
                self.armed = false;
                Ok(u64::from_ne_bytes(count))
            }
            Err(Errno::AGAIN) => {
                debug!(timer = self.name, "timer acknowledged with nothing pending");
                Ok(0)
            }
            Err(e) => Err(Error::Os {
                op: "timer read",
                source: e.into(),
            }),
        }
    }
}

/// The two timers the reactor multiplexes next to the engine's sockets.
#[derive(Debug)]
pub struct Timers {
    /// Armed by the transfer engine through its timeout callback.
    pub deadline: Timer,
    /// Owned by the scheduler, paces successive requests.
    pub pacing: Timer,
}

impl Timers {
    pub fn new() -> Result<Self> {
        Ok(Self {
            deadline: Timer::new("engine deadline")?,
            pacing: Timer::new("pacing")?,
        })
    }
}
