//! Client-side bootstrap and lifecycle core for a shared-memory media
//! driver.
//!
//! The data plane lives in a separate driver process; this crate owns the
//! client half of the control plane: discovering and validating the driver
//! through its memory-mapped CnC file, wiring up the shared IPC primitives
//! (command ring, response broadcast, counters), and scheduling the single
//! -threaded cooperative conductor that runs the long-lived protocol.
//!
//! ```no_run
//! use maestro::{Client, Context};
//!
//! let client = Client::connect(Context::new().driver_timeout_ms(1_000))?;
//! let publication = client.add_publication("ipc://orders", 42)?;
//! assert_eq!(publication.stream_id, 42);
//! # Ok::<(), maestro::ClientError>(())
//! ```

pub mod agent;
pub mod client;
pub mod cnc;
pub mod command;
pub mod conductor;
pub mod context;
pub mod error;
pub mod idle;
pub mod ipc;
pub mod proxy;
pub mod time;
pub mod trace;

pub use agent::{Agent, AgentInvoker, AgentRunner, ThreadFactory, default_thread_factory};
pub use client::{Client, ConductorAgent};
pub use cnc::{CNC_VERSION, CncFile};
pub use conductor::{ClientConductor, CompletedRegistration, Image, Publication, Subscription};
pub use context::{
    Context, ErrorHandler, ImageHandler, ImageMapMode, default_driver_dir, default_error_handler,
};
pub use error::ClientError;
pub use idle::{BusySpinIdleStrategy, IdleStrategy, NoOpIdleStrategy, SleepingIdleStrategy};
pub use ipc::{CommandRing, CountersReader, CopyBroadcastReceiver};
pub use time::{EpochClock, ManualClock, NanoClock, SystemEpochClock, SystemNanoClock};
