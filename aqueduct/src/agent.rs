//! Cooperative single-threaded agents.
//!
//! Each driver agent implements [`Agent`] and is driven by an
//! [`AgentRunner`] on its own named thread: duty cycle, idle strategy,
//! repeat until stopped. Errors never escape an agent; the runner
//! catches panics at the duty-cycle perimeter, logs, and keeps cycling.
//! Shutdown sets the running flag and keeps unparking the thread until
//! it yields.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::concurrent::BackoffIdleStrategy;
use crate::trace::{error, info};

/// A single-threaded cooperative agent.
pub trait Agent: Send {
    /// One duty cycle. Returns the amount of work performed, which
    /// drives the idle strategy.
    fn do_work(&mut self) -> usize;

    /// Called once on the agent thread after the last duty cycle.
    fn on_close(&mut self) {}
}

/// Drives an [`Agent`] on a dedicated thread.
pub struct AgentRunner {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AgentRunner {
    /// Spawns `agent` on a thread called `name`.
    ///
    /// # Panics
    ///
    /// Panics if the thread cannot be spawned.
    pub fn start(name: &str, mut idle: BackoffIdleStrategy, mut agent: impl Agent + 'static) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_flag = Arc::clone(&running);
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                info!(agent = %thread_name, "agent started");
                while thread_flag.load(Ordering::Acquire) {
                    let work = catch_unwind(AssertUnwindSafe(|| agent.do_work()));
                    match work {
                        Ok(count) => idle.idle(count),
                        Err(_panic) => {
                            error!(agent = %thread_name, "duty cycle panicked; continuing");
                            idle.idle(0);
                        }
                    }
                }
                agent.on_close();
                info!(agent = %thread_name, "agent stopped");
            })
            .expect("failed to spawn agent thread");

        Self {
            name: name.to_string(),
            running,
            handle: Some(handle),
        }
    }

    /// The agent thread's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests shutdown and joins, re-unparking the thread until it
    /// yields.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            while !handle.is_finished() {
                handle.thread().unpark();
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingAgent {
        cycles: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl Agent for CountingAgent {
        fn do_work(&mut self) -> usize {
            self.cycles.fetch_add(1, Ordering::Relaxed);
            0
        }

        fn on_close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn runs_duty_cycles_until_stopped() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let runner = AgentRunner::start(
            "test-agent",
            BackoffIdleStrategy::default(),
            CountingAgent {
                cycles: Arc::clone(&cycles),
                closed: Arc::clone(&closed),
            },
        );

        while cycles.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }

        runner.stop();
        assert!(closed.load(Ordering::Acquire));
    }

    struct PanickyAgent {
        cycles: Arc<AtomicUsize>,
    }

    impl Agent for PanickyAgent {
        fn do_work(&mut self) -> usize {
            let n = self.cycles.fetch_add(1, Ordering::Relaxed);
            assert!(n != 3, "induced failure");
            1
        }
    }

    #[test]
    fn survives_panicking_duty_cycle() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let runner = AgentRunner::start(
            "panicky-agent",
            BackoffIdleStrategy::default(),
            PanickyAgent {
                cycles: Arc::clone(&cycles),
            },
        );

        // The agent keeps cycling well past the cycle that panicked.
        while cycles.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }
        runner.stop();
    }
}
