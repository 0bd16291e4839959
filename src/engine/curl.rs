//! [`TransferEngine`] over libcurl's multi socket interface.

use std::{collections::VecDeque, mem, os::fd::RawFd, sync::Arc};

use ::curl::{
    easy::{Easy2, Handler, List, WriteError},
    multi::{Easy2Handle, Events, Multi, SocketEvents},
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Completion, DriveInput, EngineHooks, Outcome, TransferEngine, TransferId};
use crate::{
    error::{Error, Result},
    reactor::{Deadline, SocketInterest},
};

/// Response sink. Everything the peer sends back is thrown away.
pub struct Discard;

impl Handler for Discard {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        Ok(data.len())
    }
}

/// The one request this engine keeps re-issuing.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub body: Vec<u8>,
    pub verbose: bool,
}

// the multi callbacks must be `Send + 'static`, so they only record what
// libcurl asked for. `replay` hands it to the hooks before control returns.
enum Notification {
    Socket(RawFd, SocketInterest),
    Timeout(Deadline),
}

enum Slot {
    Idle(Easy2<Discard>),
    InFlight(Easy2Handle<Discard>),
    // only observable after libcurl failed to hand the easy handle back
    Lost,
}

const TOKEN: usize = 0;

pub struct CurlEngine {
    multi: Multi,
    slot: Slot,
    notifications: Arc<Mutex<Vec<Notification>>>,
    finished: VecDeque<Completion>,
}

fn interest(events: &SocketEvents) -> SocketInterest {
    if events.remove() {
        return SocketInterest::NONE;
    }
    SocketInterest {
        readable: events.input() || events.input_and_output(),
        writable: events.output() || events.input_and_output(),
    }
}

impl CurlEngine {
    pub fn new(request: &Request) -> Result<Self> {
        let mut easy = Easy2::new(Discard);
        easy.url(&request.url).map_err(Error::engine("easy url"))?;
        easy.post(true).map_err(Error::engine("easy post"))?;
        easy.post_fields_copy(&request.body)
            .map_err(Error::engine("easy post fields"))?;
        let mut headers = List::new();
        headers
            .append("Content-Type: application/json")
            .map_err(Error::engine("easy headers"))?;
        easy.http_headers(headers)
            .map_err(Error::engine("easy headers"))?;
        easy.verbose(request.verbose)
            .map_err(Error::engine("easy verbose"))?;

        let notifications = Arc::new(Mutex::new(Vec::new()));
        let mut multi = Multi::new();

        let queue = notifications.clone();
        multi
            .socket_function(move |socket, events, _| {
                queue
                    .lock()
                    .push(Notification::Socket(socket, interest(&events)));
            })
            .map_err(Error::engine("multi socket function"))?;

        let queue = notifications.clone();
        multi
            .timer_function(move |timeout| {
                queue.lock().push(Notification::Timeout(timeout.into()));
                true
            })
            .map_err(Error::engine("multi timer function"))?;

        Ok(Self {
            multi,
            slot: Slot::Idle(easy),
            notifications,
            finished: VecDeque::new(),
        })
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.slot, Slot::InFlight(_))
    }

    fn replay(&self, hooks: &mut dyn EngineHooks) -> Result<()> {
        let pending = mem::take(&mut *self.notifications.lock());
        for notification in pending {
            match notification {
                Notification::Socket(socket, interest) => {
                    hooks.on_socket_interest_changed(socket, interest)?
                }
                Notification::Timeout(deadline) => hooks.on_timeout_changed(deadline)?,
            }
        }
        Ok(())
    }

    fn collect_messages(&mut self) {
        let finished = &mut self.finished;
        self.multi.messages(|message| {
            let Some(result) = message.result() else {
                return;
            };
            let outcome = match result {
                Ok(()) => Outcome::Succeeded,
                Err(e) => Outcome::Failed(e.to_string()),
            };
            finished.push_back(Completion {
                transfer: TransferId(message.token().unwrap_or(TOKEN)),
                outcome,
            });
        });
    }
}

impl TransferEngine for CurlEngine {
    fn add_transfer(&mut self, hooks: &mut dyn EngineHooks) -> Result<TransferId> {
        let easy = match mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Idle(easy) => easy,
            other => {
                self.slot = other;
                return Err(Error::Engine {
                    op: "multi add",
                    source: "transfer is not idle".into(),
                });
            }
        };
        let mut handle = self.multi.add2(easy).map_err(Error::engine("multi add"))?;
        handle
            .set_token(TOKEN)
            .map_err(Error::engine("easy token"))?;
        self.slot = Slot::InFlight(handle);
        debug!("transfer handed to libcurl");

        self.replay(hooks)?;
        Ok(TransferId(TOKEN))
    }

    fn drive(&mut self, input: DriveInput, hooks: &mut dyn EngineHooks) -> Result<usize> {
        trace!(?input, "socket action enter");
        let running = match input {
            DriveInput::Socket(socket, readiness) => {
                let mut events = Events::new();
                events
                    .input(readiness.is_readable())
                    .output(readiness.is_writable())
                    .error(readiness.is_error());
                self.multi
                    .action(socket, &events)
                    .map_err(Error::engine("socket action by socket"))
            }
            DriveInput::Timeout => self
                .multi
                .timeout()
                .map_err(Error::engine("socket action by timer")),
        };
        // whatever libcurl requested before failing still reaches the reactor
        self.replay(hooks)?;
        let running = running?;
        trace!(running, "socket action exit");

        self.collect_messages();
        Ok(running as usize)
    }

    fn next_completion(&mut self) -> Result<Option<Completion>> {
        if self.finished.is_empty() {
            self.collect_messages();
        }
        Ok(self.finished.pop_front())
    }

    fn detach(&mut self, transfer: TransferId, hooks: &mut dyn EngineHooks) -> Result<()> {
        let handle = match mem::replace(&mut self.slot, Slot::Lost) {
            Slot::InFlight(handle) => handle,
            other => {
                self.slot = other;
                return Err(Error::Engine {
                    op: "multi remove",
                    source: format!("{transfer:?} is not in flight").into(),
                });
            }
        };
        let easy = self
            .multi
            .remove2(handle)
            .map_err(Error::engine("multi remove"))?;
        self.slot = Slot::Idle(easy);

        self.replay(hooks)
    }
}
