pub mod io;
#[cfg(test)]
pub(crate) mod testing;
pub mod timers;

use std::{convert::Infallible, os::fd::RawFd, time::Duration};

use tracing::{debug, info, trace};

pub use io::{Multiplexer, Readiness, SocketInterest};
pub use timers::{Deadline, Timer, Timers};

use crate::{
    engine::{DriveInput, EngineHooks, TransferEngine},
    error::{Error, Result},
    scheduler::Scheduler,
    spawn::Spawner,
};

/// Forwards the engine's callbacks to the multiplexer and the deadline timer.
struct Adapter<'a> {
    io: &'a mut Multiplexer,
    deadline: &'a mut Timer,
}

impl EngineHooks for Adapter<'_> {
    fn on_socket_interest_changed(&mut self, socket: RawFd, interest: SocketInterest) -> Result<()> {
        debug!(fd = socket, ?interest, "socket monitor requested");
        self.io.register(socket, interest)
    }

    fn on_timeout_changed(&mut self, deadline: Deadline) -> Result<()> {
        debug!(?deadline, "engine timeout requested");
        self.deadline.arm(deadline)
    }
}

/// The single-threaded client loop.
///
/// Every turn blocks on the multiplexer, then dispatches each ready handle in
/// delivery order: the pacing timer adds the transfer, the deadline timer and
/// the engine's sockets drive the engine, and every drive is followed by
/// reaping whatever the engine finished.
pub struct Reactor<E, S> {
    io: Multiplexer,
    timers: Timers,
    scheduler: Scheduler,
    engine: E,
    spawner: S,
    pending: usize,
}

impl<E: TransferEngine, S: Spawner> Reactor<E, S> {
    pub fn new(engine: E, spawner: S, pacing: Duration, capacity: usize) -> Result<Self> {
        let io = Multiplexer::new(capacity)?;
        let timers = Timers::new()?;
        io.watch_timer(timers.deadline.fd())?;
        io.watch_timer(timers.pacing.fd())?;
        Ok(Self {
            io,
            timers,
            scheduler: Scheduler::new(pacing),
            engine,
            spawner,
            pending: 0,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.io
    }

    /// Transfers the engine reported as still running after the last drive.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Enters the first `Waiting` state by arming the pacing timer.
    pub fn start(&mut self) -> Result<()> {
        info!(interval = ?self.scheduler.interval(), "app sleep start");
        self.timers
            .pacing
            .arm(Deadline::After(self.scheduler.interval()))
    }

    /// Starts the loop and never returns unless something fatal happens.
    pub fn run(&mut self) -> Result<Infallible> {
        self.start()?;
        loop {
            self.turn(None)?;
        }
    }

    /// Waits once and dispatches everything that wait returned.
    ///
    /// Returns the number of events handled.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        trace!("entering epoll wait");
        let ready = self.io.wait(timeout)?;
        trace!(events = ready.len(), "epoll wait returned");

        for &(fd, readiness) in &ready {
            self.dispatch(fd, readiness)?;
        }
        Ok(ready.len())
    }

    fn dispatch(&mut self, fd: RawFd, readiness: Readiness) -> Result<()> {
        if fd == self.timers.pacing.fd() {
            if self.timers.pacing.acknowledge()? == 0 {
                debug!("pacing timer was rearmed before its fire was handled");
                return Ok(());
            }
            if self.scheduler.pacing_fired() {
                self.add_transfer()?;
            }
            Ok(())
        } else if fd == self.timers.deadline.fd() {
            if self.timers.deadline.acknowledge()? == 0 {
                debug!("engine timeout was rearmed before its fire was handled");
                return Ok(());
            }
            debug!("engine timeout fired");
            self.drive(DriveInput::Timeout)
        } else {
            debug!(fd, ?readiness, "some socket became ready");
            self.drive(DriveInput::Socket(fd, readiness))
        }
    }

    fn engine_and_hooks(&mut self) -> (&mut E, Adapter<'_>) {
        let hooks = Adapter {
            io: &mut self.io,
            deadline: &mut self.timers.deadline,
        };
        (&mut self.engine, hooks)
    }

    fn add_transfer(&mut self) -> Result<()> {
        let (engine, mut hooks) = self.engine_and_hooks();
        let transfer = engine.add_transfer(&mut hooks)?;
        debug!(?transfer, "transfer added");
        Ok(())
    }

    fn drive(&mut self, input: DriveInput) -> Result<()> {
        let (engine, mut hooks) = self.engine_and_hooks();
        let pending = engine.drive(input, &mut hooks)?;
        trace!(pending, "engine driven");
        self.pending = pending;
        self.reap()
    }

    /// Drains the engine's completions. Every finished transfer is detached,
    /// followed by a detached worker and the next pacing cycle, whatever its outcome.
    fn reap(&mut self) -> Result<()> {
        trace!("check multi info");
        while let Some(completion) = self.engine.next_completion()? {
            info!(transfer = ?completion.transfer, outcome = %completion.outcome, "request completed");

            let (engine, mut hooks) = self.engine_and_hooks();
            engine.detach(completion.transfer, &mut hooks)?;

            self.spawner.spawn_detached().map_err(Error::Spawn)?;

            let interval = self.scheduler.completion_observed();
            self.timers.pacing.arm(Deadline::After(interval))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{Completion, Outcome, TransferId},
        reactor::testing::capture_logs,
        scheduler::State,
    };
    use std::{collections::VecDeque, io, os::fd::AsRawFd, os::unix::net::UnixStream};

    #[derive(Debug, Clone, Copy)]
    enum Request {
        Timeout(Deadline),
        Watch(RawFd, SocketInterest),
    }

    /// Engine double that issues scripted callbacks and completes on its deadline.
    #[derive(Default)]
    struct ScriptedEngine {
        on_add: Vec<Request>,
        complete_on_timeout: bool,
        fail_drive: bool,
        /// Closed on the first socket drive, before the engine reports it gone.
        socket: Option<UnixStream>,

        in_flight: bool,
        adds: usize,
        adds_while_in_flight: usize,
        drives: Vec<DriveInput>,
        detached: usize,
        finished: VecDeque<Completion>,
    }

    impl TransferEngine for ScriptedEngine {
        fn add_transfer(&mut self, hooks: &mut dyn EngineHooks) -> Result<TransferId> {
            if self.in_flight {
                self.adds_while_in_flight += 1;
            }
            self.in_flight = true;
            self.adds += 1;
            for request in self.on_add.clone() {
                match request {
                    Request::Timeout(deadline) => hooks.on_timeout_changed(deadline)?,
                    Request::Watch(fd, interest) => hooks.on_socket_interest_changed(fd, interest)?,
                }
            }
            Ok(TransferId(7))
        }

        fn drive(&mut self, input: DriveInput, hooks: &mut dyn EngineHooks) -> Result<usize> {
            self.drives.push(input);
            if self.fail_drive {
                return Err(Error::Engine {
                    op: "socket action by timer",
                    source: "bad state".into(),
                });
            }
            if let (DriveInput::Socket(fd, _), Some(socket)) = (input, self.socket.take()) {
                drop(socket);
                hooks.on_socket_interest_changed(fd, SocketInterest::NONE)?;
                self.finished.push_back(Completion {
                    transfer: TransferId(7),
                    outcome: Outcome::Succeeded,
                });
                return Ok(0);
            }
            if input == DriveInput::Timeout && self.complete_on_timeout && self.in_flight {
                self.finished.push_back(Completion {
                    transfer: TransferId(7),
                    outcome: Outcome::Failed("connection refused".into()),
                });
                hooks.on_timeout_changed(Deadline::Disarm)?;
                return Ok(0);
            }
            Ok(self.in_flight as usize)
        }

        fn next_completion(&mut self) -> Result<Option<Completion>> {
            Ok(self.finished.pop_front())
        }

        fn detach(&mut self, transfer: TransferId, _: &mut dyn EngineHooks) -> Result<()> {
            assert_eq!(transfer, TransferId(7));
            assert!(self.in_flight);
            self.in_flight = false;
            self.detached += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSpawner(usize);

    impl Spawner for CountingSpawner {
        fn spawn_detached(&mut self) -> io::Result<()> {
            self.0 += 1;
            Ok(())
        }
    }

    type TestReactor = Reactor<ScriptedEngine, CountingSpawner>;

    fn reactor(engine: ScriptedEngine, pacing: Duration) -> TestReactor {
        let mut reactor = Reactor::new(engine, CountingSpawner::default(), pacing, 8).unwrap();
        reactor.start().unwrap();
        reactor
    }

    fn turn_until(reactor: &mut TestReactor, done: impl Fn(&TestReactor) -> bool) {
        for _ in 0..200 {
            if done(reactor) {
                return;
            }
            reactor.turn(Some(Duration::from_millis(50))).unwrap();
        }
        panic!("reactor never reached the expected state");
    }

    #[test]
    fn pacing_fire_adds_the_transfer_once() {
        let mut reactor = reactor(ScriptedEngine::default(), Duration::from_millis(1));
        assert_eq!(reactor.scheduler().state(), State::Waiting);

        turn_until(&mut reactor, |r| r.engine().adds == 1);
        assert_eq!(reactor.scheduler().state(), State::Requesting);
        assert!(!reactor.timers().pacing.is_armed());

        for _ in 0..3 {
            reactor.turn(Some(Duration::from_millis(20))).unwrap();
        }
        assert_eq!(reactor.engine().adds, 1);
        assert_eq!(reactor.engine().adds_while_in_flight, 0);
    }

    #[test]
    fn zero_timeout_arms_the_deadline_instead_of_disarming() {
        let engine = ScriptedEngine {
            on_add: vec![Request::Timeout(Deadline::from_millis(0))],
            ..Default::default()
        };
        let mut reactor = reactor(engine, Duration::from_millis(1));

        turn_until(&mut reactor, |r| r.engine().adds == 1);
        assert!(reactor.timers().deadline.is_armed());

        turn_until(&mut reactor, |r| !r.engine().drives.is_empty());
        assert_eq!(reactor.engine().drives, vec![DriveInput::Timeout]);
        assert!(!reactor.timers().deadline.is_armed());
    }

    #[test]
    fn completion_spawns_once_and_rearms_pacing() {
        let engine = ScriptedEngine {
            on_add: vec![Request::Timeout(Deadline::Immediate)],
            complete_on_timeout: true,
            ..Default::default()
        };
        let mut reactor = reactor(engine, Duration::from_millis(30));

        turn_until(&mut reactor, |r| r.spawner().0 == 1);
        assert_eq!(reactor.engine().detached, 1);
        assert!(!reactor.engine().in_flight);
        assert_eq!(reactor.scheduler().state(), State::Waiting);
        assert_eq!(reactor.scheduler().cycles(), 1);
        assert!(reactor.timers().pacing.is_armed());
        assert_eq!(reactor.pending(), 0);

        // the idle transfer is picked up again on the next cycle
        turn_until(&mut reactor, |r| r.engine().adds == 2);
        assert_eq!(reactor.engine().adds_while_in_flight, 0);
    }

    #[test]
    fn watched_sockets_drive_the_engine() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let engine = ScriptedEngine {
            on_add: vec![Request::Watch(fd, SocketInterest::WRITABLE)],
            ..Default::default()
        };
        let mut reactor = reactor(engine, Duration::from_millis(1));

        turn_until(&mut reactor, |r| !r.engine().drives.is_empty());
        assert_eq!(reactor.multiplexer().interest(fd), Some(SocketInterest::WRITABLE));
        match reactor.engine().drives[0] {
            DriveInput::Socket(socket, readiness) => {
                assert_eq!(socket, fd);
                assert!(readiness.is_writable());
            }
            other => panic!("unexpected drive input {other:?}"),
        }
        assert_eq!(reactor.pending(), 1);
    }

    #[test]
    fn unwatching_an_unknown_socket_is_not_fatal() {
        let (a, _b) = UnixStream::pair().unwrap();
        let engine = ScriptedEngine {
            on_add: vec![Request::Watch(a.as_raw_fd(), SocketInterest::NONE)],
            ..Default::default()
        };
        let mut reactor = reactor(engine, Duration::from_millis(1));

        let ((), logs) = capture_logs(|| turn_until(&mut reactor, |r| r.engine().adds == 1));
        assert_eq!(reactor.multiplexer().watched(), 0);
        let logs = logs.contents();
        assert!(logs.contains("epoll del: fd not found"), "{logs}");
    }

    #[test]
    fn socket_closed_before_its_removal_is_not_fatal() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let engine = ScriptedEngine {
            on_add: vec![Request::Watch(fd, SocketInterest::WRITABLE)],
            socket: Some(a),
            ..Default::default()
        };
        let mut reactor = reactor(engine, Duration::from_millis(30));

        let ((), logs) = capture_logs(|| turn_until(&mut reactor, |r| r.spawner().0 == 1));
        assert_eq!(reactor.multiplexer().watched(), 0);
        assert_eq!(reactor.engine().detached, 1);
        assert_eq!(reactor.scheduler().state(), State::Waiting);
        assert!(reactor.timers().pacing.is_armed());
        let logs = logs.contents();
        assert!(logs.contains("epoll del: fd"), "{logs}");
    }

    #[test]
    fn drive_failure_is_fatal() {
        let engine = ScriptedEngine {
            on_add: vec![Request::Timeout(Deadline::Immediate)],
            fail_drive: true,
            ..Default::default()
        };
        let mut reactor = reactor(engine, Duration::from_millis(1));

        let err = (0..200)
            .find_map(|_| reactor.turn(Some(Duration::from_millis(50))).err())
            .expect("drive never failed");
        assert_eq!(err.to_string(), "socket action by timer: bad state");
        assert_eq!(reactor.spawner().0, 0);
    }
}
