//! Periodic timer feeding a named event.
//!
//! A self-rescheduling timeout signals the "tick" event five times; two
//! subscribers watch it and the second one vetoes further fan-out on the
//! last tick. Run with `cargo run --example periodic`.

use std::sync::Arc;
use std::time::Duration;

use taskmux::prelude::*;

struct TickState {
    remaining: parking_lot::Mutex<u32>,
}

fn on_tick(scheduler: &Arc<Scheduler>, _event: EventMask, _fd: u32, context: &TaskContext) {
    let state = context.downcast_ref::<TickState>().expect("tick state");
    let remaining = {
        let mut remaining = state.remaining.lock();
        *remaining -= 1;
        *remaining
    };

    let args = EventArgs::new().with(remaining);
    scheduler.event_signal("tick", &args).expect("signal tick");

    if remaining == 0 {
        scheduler.stop();
        return;
    }
    scheduler
        .add_timeout(on_tick, context.clone(), Duration::from_millis(200))
        .expect("reschedule tick");
}

fn print_tick(
    _origin: &Arc<Scheduler>,
    _event: &TaskHandle,
    _context: &TaskContext,
    args: &EventArgs,
) -> bool {
    let remaining = args.get::<u32>(0).copied().unwrap_or(0);
    println!("tick ({} left)", remaining);
    true
}

fn last_tick_veto(
    _origin: &Arc<Scheduler>,
    _event: &TaskHandle,
    _context: &TaskContext,
    args: &EventArgs,
) -> bool {
    // Returning false would stop any subscriber connected after this one
    args.get::<u32>(0).map(|left| *left > 0).unwrap_or(true)
}

fn main() {
    let scheduler = Scheduler::new(SchedulerConfig::default(), TaskContext::none(), None)
        .expect("scheduler");

    scheduler.add_event("tick").expect("declare tick");
    scheduler
        .event_connect("tick", print_tick, TaskContext::none())
        .expect("connect printer");
    scheduler
        .event_connect("tick", last_tick_veto, TaskContext::none())
        .expect("connect veto");

    let state = TaskContext::new(TickState {
        remaining: parking_lot::Mutex::new(5),
    });
    scheduler
        .add_timeout(on_tick, state, Duration::from_millis(200))
        .expect("first tick");

    scheduler.run();
    println!("done");
}
