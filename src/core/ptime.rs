//! Per-target time measurement.
//!
//! Each sample is weighted by the time elapsed since the previous one, read
//! from a clock matching the profiling mode: the monotonic clock for
//! wall-clock profiles, the target's CPU clock for CPU profiles.

use nix::errno::Errno;
use nix::time::{clock_getcpuclockid, clock_gettime, ClockId};
use thiserror::Error;

use crate::core::types::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfMethod {
    RealTime,
    CpuTime,
    IoWait,
}

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("no such process: {0}")]
    NoSuchProcess(Pid),
    #[error("io-wait profiling is not supported")]
    Unsupported,
    #[error("failed to open the process clock: {0}")]
    Clock(Errno),
    #[error("failed to read the process clock: {0}")]
    Read(Errno),
}

#[derive(Debug)]
pub struct ProcTimer {
    clock: ClockId,
    prev: u64,
}

impl ProcTimer {
    /// Binds a timer to `pid` in the given mode and takes the first reading.
    pub fn new(pid: Pid, method: ProfMethod) -> Result<ProcTimer, TimeError> {
        let clock = match method {
            ProfMethod::RealTime => ClockId::CLOCK_MONOTONIC,
            ProfMethod::CpuTime => clock_getcpuclockid(pid).map_err(|e| match e {
                Errno::ESRCH => TimeError::NoSuchProcess(pid),
                e => TimeError::Clock(e),
            })?,
            ProfMethod::IoWait => return Err(TimeError::Unsupported),
        };
        let mut timer = ProcTimer { clock, prev: 0 };
        timer.prev = timer.now()?;
        Ok(timer)
    }

    /// Nanoseconds elapsed since the previous reading; advances the baseline.
    pub fn delta(&mut self) -> Result<u64, TimeError> {
        let now = self.now()?;
        let dt = now.saturating_sub(self.prev);
        self.prev = now;
        Ok(dt)
    }

    fn now(&self) -> Result<u64, TimeError> {
        let ts = clock_gettime(self.clock).map_err(TimeError::Read)?;
        Ok(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
    }
}
