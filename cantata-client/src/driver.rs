//! Process driver
//!
//! Engines are pure state machines: they accept elapsed microseconds and
//! never read a clock. The driver is the one place that measures real
//! time. It ticks every registered engine, and shortens its sleep to the
//! smallest next-wake hint an engine reports, so timeouts fire close to
//! their deadline without a fast polling loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// A component that wants periodic processing
pub trait Process: Send + Sync {
    /// Advance by `elapsed_us`; shrink `next_wake_us` when the component
    /// needs attention sooner than that
    fn process(&self, elapsed_us: u32, next_wake_us: &mut u32);
}

/// Drives registered components from a background task
#[derive(Debug)]
pub struct ProcessDriver {
    handle: JoinHandle<()>,
}

impl ProcessDriver {
    /// Spawn a driver ticking at `tick` (the reference deployment uses
    /// 1 ms)
    pub fn spawn(items: Vec<Arc<dyn Process>>, tick: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut last = Instant::now();
            loop {
                let now = Instant::now();
                let elapsed_us = now.duration_since(last).as_micros().min(u32::MAX as u128) as u32;
                last = now;

                let mut next_wake_us = tick.as_micros().min(u32::MAX as u128) as u32;
                for item in &items {
                    item.process(elapsed_us, &mut next_wake_us);
                }

                // Floor the sleep so a zero hint cannot turn into a busy
                // loop
                let sleep_for = Duration::from_micros(next_wake_us.max(100) as u64).min(tick);
                tokio::time::sleep(sleep_for).await;
            }
        });
        Self { handle }
    }

    /// Stop the driver task
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for ProcessDriver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
