//! Deferred actions on short-lived worker threads.
//!
//! Restarting inside a request handler would cut the response off, so the
//! restart runs on its own thread after a delay.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Platform reset. On the device this does not return.
pub trait Restart: Send + Sync {
    fn restart(&self);
}

/// Runs `action` on a new thread once `delay` has elapsed.
pub fn run_after<F>(name: &str, delay: Duration, action: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .stack_size(4096)
        .spawn(move || {
            thread::sleep(delay);
            action();
        })
}

#[derive(Clone)]
pub struct RestartScheduler {
    restarter: Arc<dyn Restart>,
}

impl RestartScheduler {
    pub fn new(restarter: Arc<dyn Restart>) -> Self {
        Self { restarter }
    }

    pub fn schedule_restart(&self, delay: Duration) {
        log::info!("Restarting in {} ms", delay.as_millis());
        let restarter = Arc::clone(&self.restarter);
        let spawned = run_after("restart", delay, move || {
            log::info!("Restarting system...");
            restarter.restart();
        });
        if let Err(e) = spawned {
            // The response is already out; restarting now loses nothing.
            log::error!("Could not spawn restart worker ({e}), restarting immediately");
            self.restarter.restart();
        }
    }
}
