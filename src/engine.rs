//! The seam between the reactor and the HTTP transfer engine.
//!
//! The engine is driven, never polled: it tells the reactor which sockets and
//! which deadline it cares about through [`EngineHooks`], and the reactor calls
//! [`TransferEngine::drive`] whenever one of them becomes ready.

pub mod curl;

use std::{fmt, os::fd::RawFd};

use crate::{
    error::Result,
    reactor::{Deadline, Readiness, SocketInterest},
};

/// Notifications an engine issues synchronously from inside any of its entry points.
pub trait EngineHooks {
    /// Replace the watch for `socket`. [`SocketInterest::NONE`] stops watching it.
    fn on_socket_interest_changed(&mut self, socket: RawFd, interest: SocketInterest) -> Result<()>;

    /// Drive the engine with [`DriveInput::Timeout`] once `deadline` passes.
    fn on_timeout_changed(&mut self, deadline: Deadline) -> Result<()>;
}

/// What woke the engine up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveInput {
    Socket(RawFd, Readiness),
    Timeout,
}

/// Identifies a transfer handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub(crate) usize);

/// How a transfer ended. Only ever logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => f.write_str("ok"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub transfer: TransferId,
    pub outcome: Outcome,
}

/// An asynchronous HTTP transfer engine owning one reusable transfer.
pub trait TransferEngine {
    /// Hands the reusable transfer to the engine. It must be idle.
    fn add_transfer(&mut self, hooks: &mut dyn EngineHooks) -> Result<TransferId>;

    /// Lets the engine make progress. Returns how many transfers are still running.
    fn drive(&mut self, input: DriveInput, hooks: &mut dyn EngineHooks) -> Result<usize>;

    /// Pops the next finished transfer, if any.
    fn next_completion(&mut self) -> Result<Option<Completion>>;

    /// Takes a finished transfer back from the engine so it can be added again.
    fn detach(&mut self, transfer: TransferId, hooks: &mut dyn EngineHooks) -> Result<()>;
}
