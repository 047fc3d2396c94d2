//! Execution harnesses for cooperative agents.
//!
//! An [`Agent`] advances only inside `do_work`. Two harnesses share that
//! contract: [`AgentRunner`] owns a dedicated thread and paces it with an
//! idle strategy, while [`AgentInvoker`] is embedded and advanced by the
//! caller ticking `invoke`. Errors from a duty cycle go to the error
//! handler; an error that is fatal to the harness (a driver timeout)
//! terminates the runner loop.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::context::ErrorHandler;
use crate::error::{ClientError, Result};
use crate::idle::IdleStrategy;
use crate::trace::{debug, warn};

/// Factory for the thread an [`AgentRunner`] drives its agent on.
pub type ThreadFactory =
    Arc<dyn Fn(&str, Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> + Send + Sync>;

/// Factory producing plain named threads.
#[must_use]
pub fn default_thread_factory() -> ThreadFactory {
    Arc::new(|name, body| {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
    })
}

/// A unit of cooperative work driven by a harness.
pub trait Agent {
    /// Called once before the first duty cycle, on the driving thread.
    ///
    /// # Errors
    ///
    /// An error is reported to the error handler and the duty-cycle loop
    /// never starts; `on_close` still runs.
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// One duty cycle. Returns the number of units of work performed so
    /// the harness can decide whether to idle.
    ///
    /// # Errors
    ///
    /// Reported to the error handler; a [`ClientError::DriverTimeout`]
    /// additionally terminates the harness.
    fn do_work(&mut self) -> Result<usize>;

    /// Called exactly once when the harness shuts down.
    fn on_close(&mut self) {}

    /// Name used for the harness thread and diagnostics.
    fn role_name(&self) -> &str;
}

/// Dedicated-thread harness.
///
/// The loop calls `do_work`; on zero work it consults the idle strategy.
/// `close` flags the loop to stop, joins the thread, and is idempotent;
/// `on_close` runs on the agent thread after the loop exits.
pub struct AgentRunner {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    role_name: String,
}

impl AgentRunner {
    /// Starts `agent` on a thread from `thread_factory`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Thread`] if the thread cannot be spawned.
    pub fn start<A>(
        mut agent: A,
        mut idle_strategy: Box<dyn IdleStrategy + Send>,
        error_handler: ErrorHandler,
        thread_factory: &ThreadFactory,
    ) -> Result<Self>
    where
        A: Agent + Send + 'static,
    {
        let role_name = agent.role_name().to_string();
        let running = Arc::new(AtomicBool::new(true));
        let run_flag = Arc::clone(&running);

        let body = Box::new(move || {
            match agent.on_start() {
                Ok(()) => {
                    while run_flag.load(Ordering::Acquire) {
                        match agent.do_work() {
                            Ok(0) => idle_strategy.idle(),
                            Ok(_) => idle_strategy.reset(),
                            Err(error) => {
                                let fatal = error.is_fatal_to_harness();
                                error_handler(&error);
                                if fatal {
                                    warn!(role = agent.role_name(), "fatal error, stopping runner");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(error) => error_handler(&error),
            }
            agent.on_close();
        });

        let thread = thread_factory(&role_name, body).map_err(|source| ClientError::Thread {
            role: role_name.clone(),
            source,
        })?;

        debug!(role = %role_name, "agent runner started");

        Ok(Self {
            running,
            thread: Some(thread),
            role_name,
        })
    }

    /// Role name of the agent being run.
    #[must_use]
    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    /// Stops the loop and joins the thread. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvokerState {
    NotStarted,
    Running,
    Closed,
}

/// Embedded harness advanced by the caller.
///
/// No thread is created; the embedding application calls
/// [`AgentInvoker::invoke`] each tick. Start and close happen exactly once.
pub struct AgentInvoker<A: Agent> {
    agent: A,
    error_handler: ErrorHandler,
    state: InvokerState,
}

impl<A: Agent> AgentInvoker<A> {
    /// Wraps `agent` without starting it.
    #[must_use]
    pub fn new(agent: A, error_handler: ErrorHandler) -> Self {
        Self {
            agent,
            error_handler,
            state: InvokerState::NotStarted,
        }
    }

    /// Runs the agent's `on_start`. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientClosed`] if the invoker was already closed;
    /// errors from `on_start` close the invoker and are returned.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            InvokerState::Closed => Err(ClientError::ClientClosed),
            InvokerState::Running => Ok(()),
            InvokerState::NotStarted => {
                self.state = InvokerState::Running;
                if let Err(error) = self.agent.on_start() {
                    self.close();
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    /// Runs one duty cycle, returning the work count.
    ///
    /// Errors are reported to the error handler; a harness-fatal error
    /// closes the invoker. Returns zero when not running.
    pub fn invoke(&mut self) -> usize {
        if self.state != InvokerState::Running {
            return 0;
        }

        match self.agent.do_work() {
            Ok(work_count) => work_count,
            Err(error) => {
                let fatal = error.is_fatal_to_harness();
                (self.error_handler)(&error);
                if fatal {
                    self.close();
                }
                0
            }
        }
    }

    /// Closes the agent. A second call is a no-op.
    pub fn close(&mut self) {
        if self.state != InvokerState::Closed {
            self.state = InvokerState::Closed;
            self.agent.on_close();
        }
    }

    /// Whether `close` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == InvokerState::Closed
    }
}

impl<A: Agent> Drop for AgentInvoker<A> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::NoOpIdleStrategy;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingAgent {
        work: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail_with: Option<ClientError>,
    }

    impl Agent for CountingAgent {
        fn do_work(&mut self) -> Result<usize> {
            if let Some(error) = self.fail_with.take() {
                return Err(error);
            }
            self.work.fetch_add(1, Ordering::Relaxed);
            Ok(1)
        }

        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }

        fn role_name(&self) -> &str {
            "counting-agent"
        }
    }

    fn collecting_handler() -> (ErrorHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ErrorHandler = Arc::new(move |error: &ClientError| {
            sink.lock().unwrap().push(error.to_string());
        });
        (handler, seen)
    }

    #[test]
    fn runner_drives_work_and_closes_once() {
        let work = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (handler, _) = collecting_handler();

        let agent = CountingAgent {
            work: Arc::clone(&work),
            closes: Arc::clone(&closes),
            fail_with: None,
        };
        let mut runner = AgentRunner::start(
            agent,
            Box::new(NoOpIdleStrategy),
            handler,
            &default_thread_factory(),
        )
        .unwrap();

        while work.load(Ordering::Relaxed) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        runner.close();
        runner.close();
        assert_eq!(closes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn runner_terminates_on_driver_timeout() {
        let work = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (handler, seen) = collecting_handler();

        let agent = CountingAgent {
            work: Arc::clone(&work),
            closes: Arc::clone(&closes),
            fail_with: Some(ClientError::DriverTimeout("gone".to_string())),
        };
        let mut runner = AgentRunner::start(
            agent,
            Box::new(NoOpIdleStrategy),
            handler,
            &default_thread_factory(),
        )
        .unwrap();

        // The loop must stop on its own, before close() clears the flag.
        while closes.load(Ordering::Relaxed) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(work.load(Ordering::Relaxed), 0);
        assert!(seen.lock().unwrap()[0].contains("driver timeout"));

        runner.close();
    }

    #[test]
    fn runner_reports_and_survives_transient_errors() {
        let work = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (handler, seen) = collecting_handler();

        let agent = CountingAgent {
            work: Arc::clone(&work),
            closes: Arc::clone(&closes),
            fail_with: Some(ClientError::Backpressure),
        };
        let mut runner = AgentRunner::start(
            agent,
            Box::new(NoOpIdleStrategy),
            handler,
            &default_thread_factory(),
        )
        .unwrap();

        while work.load(Ordering::Relaxed) < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }
        runner.close();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn invoker_start_and_close_are_exactly_once() {
        let work = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (handler, _) = collecting_handler();

        let agent = CountingAgent {
            work: Arc::clone(&work),
            closes: Arc::clone(&closes),
            fail_with: None,
        };
        let mut invoker = AgentInvoker::new(agent, handler);

        assert_eq!(invoker.invoke(), 0, "must not work before start");
        invoker.start().unwrap();
        invoker.start().unwrap();
        assert_eq!(invoker.invoke(), 1);
        assert_eq!(work.load(Ordering::Relaxed), 1);

        invoker.close();
        invoker.close();
        assert_eq!(closes.load(Ordering::Relaxed), 1);
        assert_eq!(invoker.invoke(), 0, "must not work after close");
        assert!(matches!(invoker.start(), Err(ClientError::ClientClosed)));
    }

    #[test]
    fn invoker_closes_on_driver_timeout() {
        let work = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (handler, seen) = collecting_handler();

        let agent = CountingAgent {
            work: Arc::clone(&work),
            closes: Arc::clone(&closes),
            fail_with: Some(ClientError::DriverTimeout("gone".to_string())),
        };
        let mut invoker = AgentInvoker::new(agent, handler);
        invoker.start().unwrap();

        assert_eq!(invoker.invoke(), 0);
        assert!(invoker.is_closed());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
