//! The scheduler: registry, timeout queue and dispatch loop
//!
//! This module provides the scheduler kernel that multiplexes fd readiness,
//! timeouts and named events onto a single dispatch thread per scheduler.

pub mod core;
pub mod dispatch;
pub mod queue;

pub use self::core::{
    get_global, set_global, NotifyCallback, RunStatus, ScheduleStats, Scheduler, SchedulerConfig,
    TaskNotice, Wait,
};
pub(crate) use self::core::Registry;
