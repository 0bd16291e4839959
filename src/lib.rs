#![forbid(unsafe_code)]

#[macro_use]
extern crate educe;

use tracing_subscriber::EnvFilter;

pub mod config;
pub mod engine;
mod error;
/// The slow HTTP server the client is exercised against
pub mod peer;
pub mod reactor;
pub mod scheduler;
pub mod spawn;

pub use config::Config;
pub use engine::curl::CurlEngine;
pub use error::{Error, Result};
pub use reactor::Reactor;
pub use spawn::DetachedWorker;

/// Builds the client: libcurl behind the reactor, a detached worker per response.
///
/// The reactor is idle until [`Reactor::run`] (or [`Reactor::start`]) is called.
pub fn client(config: &Config) -> Result<Reactor<CurlEngine, DetachedWorker>> {
    let engine = CurlEngine::new(&config.request()?)?;
    Reactor::new(
        engine,
        DetachedWorker::new(config.worker_hold),
        config.pacing,
        config.events_capacity,
    )
}

/// Timestamped logs on stderr, filtered by `RUST_LOG` (`debug` when unset).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    // a subscriber installed earlier (by a test harness) wins
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
