//! Ptrace supervision of the target process.
//!
//! The controller keeps three kinds of stop apart: stops caused by our own
//! SIGSTOP (consumed; the target resumes with signal 0), stops caused by
//! signals destined for the target (passed through on resume), and
//! job-control stops ({SIGTSTP, SIGTTIN, SIGTTOU}) which mean another
//! supervisor owns the target, in which case we forward the signal and
//! detach rather than fight over it.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::getpid;
use thiserror::Error;

use crate::core::types::Pid;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(
        "ptrace attach to {pid} was denied; run as root, or check \
         /proc/sys/kernel/yama/ptrace_scope and container ptrace settings"
    )]
    PermissionDenied { pid: Pid },
    #[error("no such process: {pid}")]
    NoSuchProcess { pid: Pid },
    #[error("{op} failed on {pid}: {errno}")]
    Ptrace {
        op: &'static str,
        pid: Pid,
        errno: Errno,
    },
    #[error("waitpid on {pid} failed: {errno}")]
    Wait { pid: Pid, errno: Errno },
    #[error("unexpected wait status: {0:?}")]
    UnexpectedStatus(WaitStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Detached,
    Attaching,
    Running,
    Stopping,
    Stopped,
    Terminating,
}

/// What a wait on the target reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Nothing pending (non-blocking wait only).
    Nothing,
    /// The target entered a ptrace stop; the stop signal was recorded.
    Stopped,
    Exited(i32),
    Killed(Signal),
    /// The target was stopped by its job-control terminal; someone else is
    /// supervising it.
    JobControl(Signal),
}

/// The signal that delivered a stop, and who sent it if known.
#[derive(Debug, Clone, Copy)]
pub struct StopInfo {
    pub signal: Signal,
    pub sender: Option<Pid>,
}

pub struct Tracer {
    pid: Pid,
    state: TraceState,
    stop: Option<StopInfo>,
}

impl Tracer {
    /// Attaches to `pid`, consumes the initial attach stop, and leaves the
    /// target running. Attach refusal is fatal; everything after that is
    /// reported through the returned state.
    pub fn attach(pid: Pid) -> Result<Tracer, TraceError> {
        if Path::new("/proc/vz").exists() {
            warn!("OpenVZ container detected; ptrace may be restricted here");
        }

        let mut tracer = Tracer {
            pid,
            state: TraceState::Attaching,
            stop: None,
        };

        ptrace::attach(pid).map_err(|errno| match errno {
            Errno::EPERM | Errno::EACCES => TraceError::PermissionDenied { pid },
            Errno::ESRCH => TraceError::NoSuchProcess { pid },
            errno => TraceError::Ptrace {
                op: "PTRACE_ATTACH",
                pid,
                errno,
            },
        })?;

        match tracer.wait(true)? {
            WaitOutcome::Stopped | WaitOutcome::JobControl(_) => {
                // the attach stop is ours, not the target's: swallow it
                tracer.stop = None;
                tracer.resume()?;
            }
            WaitOutcome::Exited(_) | WaitOutcome::Killed(_) => {}
            WaitOutcome::Nothing => unreachable!("blocking wait returned nothing"),
        }
        Ok(tracer)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn last_stop(&self) -> Option<StopInfo> {
        self.stop
    }

    /// Stops the target with our own SIGSTOP and waits for the stop to land.
    pub fn interrupt(&mut self) -> Result<WaitOutcome, TraceError> {
        self.state = TraceState::Stopping;
        signal::kill(self.pid, Signal::SIGSTOP).map_err(|errno| match errno {
            Errno::ESRCH => TraceError::NoSuchProcess { pid: self.pid },
            errno => TraceError::Ptrace {
                op: "kill(SIGSTOP)",
                pid: self.pid,
                errno,
            },
        })?;
        self.wait(true)
    }

    /// Resumes a stopped target, forwarding the captured signal unless the
    /// stop was our own doing.
    pub fn resume(&mut self) -> Result<(), TraceError> {
        let sig = self.stop.and_then(|stop| forwarded_signal(&stop, getpid()));
        if let Some(sig) = sig {
            debug!("reflecting signal {} to {}", sig, self.pid);
        }
        ptrace::cont(self.pid, sig).map_err(|errno| TraceError::Ptrace {
            op: "PTRACE_CONT",
            pid: self.pid,
            errno,
        })?;
        self.state = TraceState::Running;
        self.stop = None;
        Ok(())
    }

    /// Consumes every pending wait status without blocking, resuming the
    /// target after each intermediate stop so foreign signals keep flowing.
    pub fn drain(&mut self) -> Result<WaitOutcome, TraceError> {
        if matches!(self.state, TraceState::Terminating | TraceState::Detached) {
            return Ok(WaitOutcome::Nothing);
        }
        loop {
            match self.wait(false)? {
                WaitOutcome::Stopped => self.resume()?,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Detaches, forwarding any captured pass-through signal. A running
    /// target is stopped first; detaching requires a ptrace stop.
    pub fn detach(&mut self) -> Result<(), TraceError> {
        match self.state {
            TraceState::Detached | TraceState::Terminating => return Ok(()),
            TraceState::Running | TraceState::Stopping | TraceState::Attaching => {
                match self.interrupt()? {
                    WaitOutcome::Stopped | WaitOutcome::JobControl(_) => {}
                    WaitOutcome::Exited(_) | WaitOutcome::Killed(_) => return Ok(()),
                    WaitOutcome::Nothing => {}
                }
            }
            TraceState::Stopped => {}
        }
        let sig = self.stop.and_then(|stop| forwarded_signal(&stop, getpid()));
        match ptrace::detach(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                return Err(TraceError::Ptrace {
                    op: "PTRACE_DETACH",
                    pid: self.pid,
                    errno,
                })
            }
        }
        self.state = TraceState::Detached;
        self.stop = None;
        Ok(())
    }

    fn wait(&mut self, blocked: bool) -> Result<WaitOutcome, TraceError> {
        let flags = if blocked {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };
        let status = loop {
            match waitpid(self.pid, flags) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(TraceError::Wait {
                        pid: self.pid,
                        errno,
                    })
                }
            }
        };
        self.classify(status)
    }

    fn classify(&mut self, status: WaitStatus) -> Result<WaitOutcome, TraceError> {
        match status {
            WaitStatus::StillAlive => Ok(WaitOutcome::Nothing),
            WaitStatus::Exited(_, code) => {
                self.state = TraceState::Terminating;
                Ok(WaitOutcome::Exited(code))
            }
            WaitStatus::Signaled(_, sig, _) => {
                self.state = TraceState::Terminating;
                Ok(WaitOutcome::Killed(sig))
            }
            WaitStatus::Stopped(_, sig) => {
                self.state = TraceState::Stopped;
                self.stop = Some(StopInfo {
                    signal: sig,
                    sender: self.stop_sender(),
                });
                if is_job_control(sig) {
                    Ok(WaitOutcome::JobControl(sig))
                } else {
                    Ok(WaitOutcome::Stopped)
                }
            }
            other => Err(TraceError::UnexpectedStatus(other)),
        }
    }

    /// Who delivered the stop signal. Group stops have no siginfo; those
    /// read as an unknown sender.
    fn stop_sender(&self) -> Option<Pid> {
        ptrace::getsiginfo(self.pid)
            .ok()
            .map(|info| Pid::from_raw(unsafe { info.si_pid() }))
    }
}

impl Drop for Tracer {
    // The target must never be left stopped by us, whatever path exits the
    // session.
    fn drop(&mut self) {
        match self.state {
            TraceState::Stopped => {
                let _ = ptrace::detach(self.pid, None);
            }
            TraceState::Running | TraceState::Stopping | TraceState::Attaching => {
                if signal::kill(self.pid, Signal::SIGSTOP).is_ok() {
                    while let Ok(status) = waitpid(self.pid, None) {
                        match status {
                            WaitStatus::Stopped(..) => {
                                let _ = ptrace::detach(self.pid, None);
                                break;
                            }
                            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => break,
                            _ => continue,
                        }
                    }
                }
            }
            TraceState::Detached | TraceState::Terminating => {}
        }
    }
}

fn is_job_control(sig: Signal) -> bool {
    matches!(sig, Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU)
}

/// The signal to deliver on resume: our own SIGSTOP is consumed, anything
/// else belongs to the target. A SIGSTOP with no readable sender is a
/// group stop, which only we can have caused while tracing.
fn forwarded_signal(stop: &StopInfo, own_pid: Pid) -> Option<Signal> {
    if stop.signal == Signal::SIGSTOP && stop.sender.map_or(true, |sender| sender == own_pid) {
        None
    } else {
        Some(stop.signal)
    }
}

/// The state character of `pid` from `/proc/<pid>/stat`: one of `RSDZTW`.
pub fn process_state(pid: Pid) -> Option<char> {
    let stat = fs::read(format!("/proc/{}/stat", pid)).ok()?;
    // the comm field may itself contain ')', so find the last one
    let close = stat.iter().rposition(|&b| b == b')')?;
    stat.get(close + 2).map(|&b| b as char)
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};

    use super::*;

    fn spawn_target() -> Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep")
    }

    fn tracer_for(pid: Pid) -> Tracer {
        Tracer {
            pid,
            state: TraceState::Running,
            stop: None,
        }
    }

    #[test]
    fn test_classify_lifecycle_statuses() {
        let pid = Pid::from_raw(1234);
        let mut tracer = tracer_for(pid);

        assert_eq!(
            tracer.classify(WaitStatus::Exited(pid, 3)).unwrap(),
            WaitOutcome::Exited(3)
        );
        assert_eq!(tracer.state(), TraceState::Terminating);

        let mut tracer = tracer_for(pid);
        assert_eq!(
            tracer
                .classify(WaitStatus::Signaled(pid, Signal::SIGKILL, false))
                .unwrap(),
            WaitOutcome::Killed(Signal::SIGKILL)
        );
        assert_eq!(tracer.state(), TraceState::Terminating);

        let mut tracer = tracer_for(pid);
        assert_eq!(
            tracer.classify(WaitStatus::StillAlive).unwrap(),
            WaitOutcome::Nothing
        );

        let mut tracer = tracer_for(pid);
        assert!(matches!(
            tracer.classify(WaitStatus::Continued(pid)),
            Err(TraceError::UnexpectedStatus(_))
        ));
    }

    #[test]
    fn test_classify_job_control() {
        let pid = Pid::from_raw(1234);
        for sig in [Signal::SIGTSTP, Signal::SIGTTIN, Signal::SIGTTOU] {
            let mut tracer = tracer_for(pid);
            assert_eq!(
                tracer.classify(WaitStatus::Stopped(pid, sig)).unwrap(),
                WaitOutcome::JobControl(sig)
            );
            assert_eq!(tracer.state(), TraceState::Stopped);
            assert_eq!(tracer.last_stop().unwrap().signal, sig);
        }
    }

    #[test]
    fn test_forwarded_signal_policy() {
        let me = Pid::from_raw(100);
        let other = Pid::from_raw(200);

        let ours = StopInfo {
            signal: Signal::SIGSTOP,
            sender: Some(me),
        };
        assert_eq!(forwarded_signal(&ours, me), None);

        let group_stop = StopInfo {
            signal: Signal::SIGSTOP,
            sender: None,
        };
        assert_eq!(forwarded_signal(&group_stop, me), None);

        let foreign_stop = StopInfo {
            signal: Signal::SIGSTOP,
            sender: Some(other),
        };
        assert_eq!(forwarded_signal(&foreign_stop, me), Some(Signal::SIGSTOP));

        let usr1 = StopInfo {
            signal: Signal::SIGUSR1,
            sender: Some(other),
        };
        assert_eq!(forwarded_signal(&usr1, me), Some(Signal::SIGUSR1));
    }

    #[test]
    fn test_attach_missing_process() {
        let err = Tracer::attach(Pid::from_raw(0x3fff_fff0)).unwrap_err();
        assert!(matches!(err, TraceError::NoSuchProcess { .. }));
    }

    #[test]
    fn test_stop_resume_detach_cycle() {
        let mut child = spawn_target();
        let pid = Pid::from_raw(child.id() as i32);

        let mut tracer = Tracer::attach(pid).expect("attach failed");
        assert_eq!(tracer.state(), TraceState::Running);

        for _ in 0..3 {
            let outcome = tracer.interrupt().expect("interrupt failed");
            assert_eq!(outcome, WaitOutcome::Stopped);
            assert_eq!(tracer.state(), TraceState::Stopped);
            assert_eq!(tracer.last_stop().unwrap().signal, Signal::SIGSTOP);

            tracer.resume().expect("resume failed");
            assert_eq!(tracer.state(), TraceState::Running);
        }

        assert_eq!(tracer.drain().unwrap(), WaitOutcome::Nothing);

        tracer.detach().expect("detach failed");
        assert_eq!(tracer.state(), TraceState::Detached);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_target_death_reported() {
        let mut child = spawn_target();
        let pid = Pid::from_raw(child.id() as i32);

        let mut tracer = Tracer::attach(pid).expect("attach failed");
        child.kill().unwrap();

        let outcome = loop {
            match tracer.drain().unwrap() {
                WaitOutcome::Nothing => continue,
                outcome => break outcome,
            }
        };
        assert_eq!(outcome, WaitOutcome::Killed(Signal::SIGKILL));
        assert_eq!(tracer.state(), TraceState::Terminating);

        // the tracer already reaped the child
        let _ = child.wait();
    }

    #[test]
    fn test_process_state_of_live_process() {
        let state = process_state(Pid::this()).expect("no stat entry for self");
        assert!("RSDZTW".contains(state), "unexpected state {:?}", state);
    }
}
