//! The sampling scheduler.
//!
//! One thread drives everything. The kernel supplies the asynchrony
//! (interval timer, child status changes, keyboard input) and the
//! handlers in [`signals`] latch it into flags. The loop blocks in
//! exactly one place, a select on the controlling terminal, and drains
//! the flags whenever a signal interrupts it.

mod signals;

use std::fs::File;
use std::io::{IsTerminal, Read};
use std::os::fd::AsFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::debug;
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};

use crate::core::calltree::CallTree;
use crate::core::ptime::{ProcTimer, ProfMethod};
use crate::core::symbols::{AddressIndex, FuncId};
use crate::core::tracer::{self, TraceState, Tracer, WaitOutcome};
use crate::core::types::{Pid, Stack};
use crate::core::unwinder::RemoteUnwinder;
use crate::ui;

pub const DEFAULT_FREQUENCY: u32 = 100;

/// Everything the session needs from the command line.
pub struct Config {
    /// Process to profile.
    pub pid: Pid,
    /// Samples per second.
    pub frequency: u32,
    /// What the interval cost measures, and whether sleeping targets are
    /// sampled at all.
    pub method: ProfMethod,
    /// Where to save a Callgrind dump of the final profile.
    pub dump_path: Option<PathBuf>,
    /// Rendering options for the interactive report.
    pub view: ui::visualize::Options,
}

/// Live state of one profiling run.
struct Session {
    config: Config,
    index: AddressIndex,
    tracer: Tracer,
    unwinder: RemoteUnwinder,
    timer: ProcTimer,
    tree: CallTree,
    stack: Stack,
    frames: Vec<FuncId>,
    ticks: u64,
    captured: u64,
    accounted: u64,
}

/// Attaches to the target and profiles it until it goes away or the user
/// interrupts.
pub fn run(config: Config, index: AddressIndex) -> Result<()> {
    let pid = config.pid;
    let timer = ProcTimer::new(pid, config.method)
        .with_context(|| format!("failed to bind a {:?} timer to {}", config.method, pid))?;

    crate::status!("Attaching to process {}", pid);
    let tracer = Tracer::attach(pid)?;
    if tracer.state() == TraceState::Terminating {
        crate::status!("Target process {} went away during attach", pid);
        return Ok(());
    }
    let unwinder = RemoteUnwinder::new(pid).context("failed to initialize the remote unwinder")?;

    signals::install().context("failed to install signal handlers")?;
    signals::start_interval_timer(config.frequency).context("failed to arm the interval timer")?;

    crate::status!(
        "Starting profile ({} Hz, {})",
        config.frequency,
        match config.method {
            ProfMethod::RealTime => "wall clock",
            ProfMethod::CpuTime => "CPU time",
            ProfMethod::IoWait => "io wait",
        }
    );
    crate::status!("Press ENTER to show the profile, ^C to stop");

    let mut session = Session {
        config,
        index,
        tracer,
        unwinder,
        timer,
        tree: CallTree::new(),
        stack: Stack::new(),
        frames: Vec::new(),
        ticks: 0,
        captured: 0,
        accounted: 0,
    };

    // the first interval covers attach and symbol loading, not the workload
    let _ = session.timer.delta();

    session.run_loop()
}

impl Session {
    fn run_loop(&mut self) -> Result<()> {
        loop {
            let key_pressed = wait_for_event()?;
            let mut outcome = WaitOutcome::Nothing;

            if signals::take_tick() {
                self.ticks += 1;
                if self.tracer.state() == TraceState::Running {
                    outcome = self.sample()?;
                }
            }

            if matches!(outcome, WaitOutcome::Nothing | WaitOutcome::Stopped) {
                outcome = self.tracer.drain()?;
            }

            if signals::interrupted_twice() {
                crate::status!("Exit");
                self.tracer.detach()?;
                return Ok(());
            }

            let finished = !matches!(outcome, WaitOutcome::Nothing | WaitOutcome::Stopped);
            if signals::interrupted() || key_pressed || finished {
                self.report()?;
            }

            match outcome {
                WaitOutcome::Exited(code) => {
                    crate::status!("Target process {} exited with code {}", self.tracer.pid(), code);
                    return Ok(());
                }
                WaitOutcome::Killed(sig) => {
                    crate::status!("Target process {} was killed by {}", self.tracer.pid(), sig);
                    return Ok(());
                }
                WaitOutcome::JobControl(sig) => {
                    crate::status!(
                        "Target process {} was stopped by {}; leaving it to its supervisor",
                        self.tracer.pid(),
                        sig
                    );
                    self.tracer.detach()?;
                    return Ok(());
                }
                WaitOutcome::Nothing | WaitOutcome::Stopped => {}
            }

            if signals::interrupted() {
                self.tracer.detach()?;
                return Ok(());
            }
        }
    }

    /// One stop → unwind → resume cycle. The target is resumed before the
    /// captured stack is resolved and aggregated.
    fn sample(&mut self) -> Result<WaitOutcome> {
        // the baseline must advance every tick, sampled or not
        let cost = self.timer.delta()?;
        if !should_sample(self.config.method, tracer::process_state(self.tracer.pid())) {
            return Ok(WaitOutcome::Nothing);
        }

        let outcome = self.tracer.interrupt()?;
        if outcome != WaitOutcome::Stopped {
            return Ok(outcome);
        }

        self.captured += 1;
        let unwound = self.unwinder.sample(&mut self.stack);
        self.tracer.resume()?;

        match unwound {
            Ok(()) => {
                resolve_stack(&self.index, &self.stack, &mut self.frames);
                if self.tree.record(&self.frames, cost) {
                    self.accounted += 1;
                }
            }
            Err(e) => debug!("dropping sample, unwind failed: {}", e),
        }
        debug_assert!(self.accounted <= self.captured && self.captured <= self.ticks);
        Ok(WaitOutcome::Stopped)
    }

    fn report(&mut self) -> Result<()> {
        if self.tree.is_empty() {
            crate::status!("No stack snapshots collected yet");
            return Ok(());
        }
        crate::status!(
            "{} snapshots caught ({} dropped)",
            self.captured,
            self.captured - self.accounted
        );
        let stdout = std::io::stdout();
        ui::visualize::render(
            &mut stdout.lock(),
            &self.tree,
            &self.index,
            &self.config.view,
        )?;
        if let Some(path) = &self.config.dump_path {
            let mut file = File::create(path)
                .with_context(|| format!("failed to create dump file {}", path.display()))?;
            ui::callgrind::write(&mut file, &self.tree, &self.index)?;
            crate::status!("Profile saved to {} (Callgrind format)", path.display());
        }
        Ok(())
    }
}

/// Whether this tick should be sampled. Wall-clock profiles always
/// sample; CPU profiles skip targets that are not runnable, since a
/// sleeping process accrues no CPU time and sampling it would charge its
/// waits to whatever frame it sleeps in.
fn should_sample(method: ProfMethod, state: Option<char>) -> bool {
    match method {
        ProfMethod::RealTime => true,
        ProfMethod::CpuTime => state == Some('R'),
        ProfMethod::IoWait => false,
    }
}

/// Resolves a captured stack into outermost-first function ids, dropping
/// unresolved frames. Empty and truncated captures resolve to nothing.
fn resolve_stack(index: &AddressIndex, stack: &Stack, frames: &mut Vec<FuncId>) {
    frames.clear();
    if stack.is_empty() || stack.is_truncated() {
        return;
    }
    for &ip in stack.ips().iter().rev() {
        if let Some(id) = index.lookup(ip) {
            frames.push(id);
        }
    }
}

/// Blocks until a signal arrives or the user presses a key. Returns
/// whether a full line of input was consumed.
fn wait_for_event() -> Result<bool> {
    let stdin = std::io::stdin();
    let mut readfds = FdSet::new();
    if stdin.is_terminal() {
        readfds.insert(stdin.as_fd());
    }

    match select(None, Some(&mut readfds), None, None, None) {
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(errno).context("select on the terminal failed"),
        Ok(n) if n > 0 && readfds.contains(stdin.as_fd()) => {
            drain_stdin();
            Ok(true)
        }
        Ok(_) => Ok(false),
    }
}

/// The user may type characters before ENTER; discard everything pending.
fn drain_stdin() {
    let mut pending: libc::c_int = 0;
    if unsafe { libc::ioctl(libc::STDIN_FILENO, libc::FIONREAD, &mut pending) } == -1 {
        return;
    }
    let mut buf = [0u8; 64];
    let mut stdin = std::io::stdin();
    while pending > 0 {
        match stdin.read(&mut buf) {
            Ok(n) if n > 0 => pending -= n as libc::c_int,
            _ => break,
        }
    }
}
