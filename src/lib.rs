//! # taskmux
//!
//! A callback-driven main-loop scheduler for network programs. One dispatch
//! thread multiplexes three classes of work — readiness on file handles,
//! time-based expirations, and named application events — while other
//! threads register, re-arm and cancel work safely.
//!
//! ## Features
//!
//! - **Fd tasks**: readiness callbacks for raw file handles, armed through
//!   the platform poller (mio on unix)
//! - **Timeouts**: one-shot timers on a monotonic clock, with a recycled
//!   node freelist for bursty workloads
//! - **Events**: named multi-subscriber events shared by a whole scheduler
//!   hierarchy through its root
//! - **Cross-thread safety**: registration and cancellation from any
//!   thread, with a wakeup primitive that pulls a blocked poll out promptly
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskmux::prelude::*;
//!
//! fn on_tick(_s: &Arc<Scheduler>, _event: EventMask, _fd: u32, _ctx: &TaskContext) {
//!     println!("tick");
//! }
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default(), TaskContext::none(), None)
//!     .expect("scheduler");
//! scheduler
//!     .add_timeout(on_tick, TaskContext::none(), Duration::from_millis(50))
//!     .expect("timer");
//! scheduler.run_once(Wait::Auto);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod event;
pub mod poller;
pub mod scheduler;
pub mod task;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::{EventArgs, EventCallback, EventRef};
    pub use crate::scheduler::{
        get_global, set_global, NotifyCallback, RunStatus, ScheduleStats, Scheduler,
        SchedulerConfig, TaskNotice, Wait,
    };
    pub use crate::task::{EventMask, TaskCallback, TaskContext, TaskHandle, TaskKind};
}

pub use prelude::*;
