//! Latched signal flags for the event loop.
//!
//! Handlers only set atomics; all real work happens in the main loop. The
//! interval timer and SIGCHLD exist mostly to interrupt the blocking
//! select, which is the loop's single suspension point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static TICK_PENDING: AtomicBool = AtomicBool::new(false);
static INTERRUPT_PENDING: AtomicBool = AtomicBool::new(false);
static INTERRUPT_TWICE: AtomicBool = AtomicBool::new(false);
static LAST_INTERRUPT_NS: AtomicU64 = AtomicU64::new(0);

/// A second ^C inside this window means "quit now, skip the report".
const DOUBLE_INTERRUPT_WINDOW_NS: u64 = 333_000_000;

extern "C" fn on_alarm(_: libc::c_int) {
    TICK_PENDING.store(true, Ordering::SeqCst);
}

extern "C" fn on_child(_: libc::c_int) {
    // nothing to latch: the EINTR wakes the main loop, which drains waits
}

extern "C" fn on_interrupt(_: libc::c_int) {
    let now = monotonic_ns();
    let last = LAST_INTERRUPT_NS.swap(now, Ordering::SeqCst);
    if INTERRUPT_PENDING.swap(true, Ordering::SeqCst)
        && now.wrapping_sub(last) < DOUBLE_INTERRUPT_WINDOW_NS
    {
        INTERRUPT_TWICE.store(true, Ordering::SeqCst);
    }
}

// clock_gettime is async-signal-safe, Instant::now is not guaranteed to be
fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Installs the SIGALRM/SIGCHLD/SIGINT latches. No SA_RESTART: the
/// signals must interrupt the select.
pub fn install() -> nix::Result<()> {
    let latch = |handler: extern "C" fn(libc::c_int)| {
        SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty())
    };
    unsafe {
        sigaction(Signal::SIGALRM, &latch(on_alarm))?;
        sigaction(Signal::SIGCHLD, &latch(on_child))?;
        sigaction(Signal::SIGINT, &latch(on_interrupt))?;
    }
    Ok(())
}

/// Arms the periodic SIGALRM at `freq_hz` ticks per second.
pub fn start_interval_timer(freq_hz: u32) -> std::io::Result<()> {
    let period_us = (1_000_000 / u64::from(freq_hz.max(1))).max(1) as i64;
    let interval = libc::timeval {
        tv_sec: period_us / 1_000_000,
        tv_usec: (period_us % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Consumes a pending tick, if any.
pub fn take_tick() -> bool {
    TICK_PENDING.swap(false, Ordering::SeqCst)
}

pub fn interrupted() -> bool {
    INTERRUPT_PENDING.load(Ordering::SeqCst)
}

pub fn interrupted_twice() -> bool {
    INTERRUPT_TWICE.load(Ordering::SeqCst)
}
