//! Set-of-bits with blocking wait, bridging radio callbacks to a caller.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub const CONNECTED: u32 = 1 << 0;
pub const FAILED: u32 = 1 << 1;

#[derive(Debug, Default)]
pub struct EventSet {
    bits: Mutex<u32>,
    changed: Condvar,
}

impl EventSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, bits: u32) {
        let mut current = self.bits.lock().unwrap_or_else(|p| p.into_inner());
        *current |= bits;
        self.changed.notify_all();
    }

    /// Blocks until any bit of `mask` is set or `timeout` elapses. Returns
    /// the matching bits, zero on timeout. Bits are left set.
    pub fn wait_any(&self, mask: u32, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut current = self.bits.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if *current & mask != 0 {
                return *current & mask;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            current = match self.changed.wait_timeout(current, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
