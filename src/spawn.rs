use std::{io, thread, time::Duration};

use tracing::debug;

/// Starts the fire-and-forget work that follows every completed transfer.
pub trait Spawner {
    fn spawn_detached(&mut self) -> io::Result<()>;
}

/// Pretends to process the response on a worker thread that is never joined.
#[derive(Debug)]
pub struct DetachedWorker {
    hold: Duration,
    spawned: u64,
}

impl DetachedWorker {
    pub fn new(hold: Duration) -> Self {
        Self { hold, spawned: 0 }
    }

    pub fn spawned(&self) -> u64 {
        self.spawned
    }
}

impl Spawner for DetachedWorker {
    fn spawn_detached(&mut self) -> io::Result<()> {
        let hold = self.hold;
        thread::Builder::new()
            .name(format!("worker-{}", self.spawned))
            .spawn(move || thread::sleep(hold))?;
        self.spawned += 1;
        debug!(spawned = self.spawned, "worker created");
        Ok(())
    }
}
