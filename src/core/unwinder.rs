//! Remote stack unwinding.
//!
//! The primary walker drives libunwind's ptrace accessors over the
//! stopped target. The address space is created once per session with
//! global caching, so unwind tables are only parsed on the first sample
//! of each image. When DWARF-based unwinding fails (stripped unwind
//! tables, JIT regions, images with broken CFI), a frame-pointer chain
//! walk over the target's saved registers recovers what it can; only
//! code built with frame pointers yields full stacks that way, which is
//! why it is the fallback and not the default.
//!
//! Either walker may only run while the controller has the target in a
//! ptrace stop.

use std::io::IoSliceMut;

use log::debug;
use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use thiserror::Error;
use unwind::{
    Accessors, AddressSpace, Byteorder, CachingPolicy, Cursor, PTraceState, PTraceStateRef, RegNum,
};

use crate::core::types::{Pid, Stack};

#[derive(Debug, Error)]
pub enum UnwindError {
    #[error("dwarf unwind failed: {0}")]
    Dwarf(#[from] unwind::Error),
    #[error("failed to read target registers: {0}")]
    Registers(Errno),
    #[error("failed to read target memory at {addr:#x}: {errno}")]
    Memory { addr: u64, errno: Errno },
    #[error("frame-pointer unwinding is not supported on this architecture")]
    Unsupported,
}

pub struct RemoteUnwinder {
    space: AddressSpace<PTraceStateRef>,
    state: PTraceState,
    pid: Pid,
}

impl RemoteUnwinder {
    pub fn new(pid: Pid) -> Result<RemoteUnwinder, UnwindError> {
        let mut space = AddressSpace::new(Accessors::ptrace(), Byteorder::DEFAULT)?;
        space.set_caching_policy(CachingPolicy::Global)?;
        let state = PTraceState::new(pid.as_raw() as _)?;
        Ok(RemoteUnwinder { space, state, pid })
    }

    /// Walks the target's current frames into `stack`, innermost first.
    ///
    /// A stack that fills to capacity reads as truncated and the caller
    /// drops the sample.
    pub fn sample(&self, stack: &mut Stack) -> Result<(), UnwindError> {
        match self.dwarf_walk(stack) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("dwarf unwind failed ({}), walking frame pointers", e);
                frame_pointer_walk(self.pid, stack)
            }
        }
    }

    fn dwarf_walk(&self, stack: &mut Stack) -> Result<(), UnwindError> {
        stack.clear();
        let mut cursor = Cursor::remote(&self.space, &self.state)?;
        loop {
            let ip = cursor.register(RegNum::IP)?;
            if !stack.push(ip) {
                break;
            }
            if !cursor.step()? {
                break;
            }
        }
        Ok(())
    }
}

const WORD: u64 = 8;

/// The lowest address a return address or frame slot can plausibly live
/// at; anything below is the null page and means the chain is garbage.
const MIN_PLAUSIBLE_ADDR: u64 = 0x1000;

/// Walks the saved frame-pointer chain: each frame stores the caller's
/// frame pointer at `[fp]` and the return address at `[fp + 8]`. The walk
/// ends at the first frame that breaks the chain; an unreadable slot is a
/// normal end, not an error.
fn frame_pointer_walk(pid: Pid, stack: &mut Stack) -> Result<(), UnwindError> {
    let (ip, mut fp) = entry_registers(pid)?;
    stack.clear();
    if !stack.push(ip) {
        return Ok(());
    }
    while fp >= MIN_PLAUSIBLE_ADDR {
        let (next_fp, ret) = match (read_word(pid, fp), read_word(pid, fp + WORD)) {
            (Ok(next_fp), Ok(ret)) => (next_fp, ret),
            _ => break,
        };
        if ret < MIN_PLAUSIBLE_ADDR || !stack.push(ret) {
            break;
        }
        // frames live at strictly increasing addresses; anything else is
        // a loop or a clobbered slot
        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }
    Ok(())
}

/// The stopped target's instruction and frame pointers.
#[cfg(target_arch = "x86_64")]
fn entry_registers(pid: Pid) -> Result<(u64, u64), UnwindError> {
    let regs = nix::sys::ptrace::getregs(pid).map_err(UnwindError::Registers)?;
    Ok((regs.rip, regs.rbp))
}

#[cfg(not(target_arch = "x86_64"))]
fn entry_registers(_pid: Pid) -> Result<(u64, u64), UnwindError> {
    Err(UnwindError::Unsupported)
}

/// Reads one word of the target's memory. The target being stopped makes
/// the read race-free; reading our own address space needs no attach at
/// all, which the tests rely on.
fn read_word(pid: Pid, addr: u64) -> Result<u64, UnwindError> {
    let mut word = [0u8; WORD as usize];
    let len = word.len();
    let mut local = [IoSliceMut::new(&mut word)];
    let remote = [RemoteIoVec {
        base: addr as usize,
        len,
    }];
    match process_vm_readv(pid, &mut local, &remote) {
        Ok(n) if n == len => Ok(u64::from_ne_bytes(word)),
        Ok(_) => Err(UnwindError::Memory {
            addr,
            errno: Errno::EFAULT,
        }),
        Err(errno) => Err(UnwindError::Memory { addr, errno }),
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};

    use super::*;
    use crate::core::tracer::{TraceState, Tracer, WaitOutcome};

    fn spawn_target() -> Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep")
    }

    #[test]
    fn test_read_word_from_own_process() {
        let value: u64 = 0x1122_3344_5566_7788;
        let addr = &value as *const u64 as u64;
        assert_eq!(read_word(Pid::this(), addr).unwrap(), value);
    }

    #[test]
    fn test_read_word_unmapped_address() {
        // the null page is never mapped
        let err = read_word(Pid::this(), 0x10).unwrap_err();
        assert!(matches!(err, UnwindError::Memory { .. }));
    }

    #[test]
    fn test_unwind_stopped_target() {
        let mut child = spawn_target();
        let pid = Pid::from_raw(child.id() as i32);

        let mut tracer = Tracer::attach(pid).expect("attach failed");
        let unwinder = RemoteUnwinder::new(pid).expect("unwinder init failed");

        assert_eq!(tracer.interrupt().unwrap(), WaitOutcome::Stopped);
        let mut stack = Stack::new();
        unwinder.sample(&mut stack).expect("unwind failed");
        assert!(stack.depth() >= 1);
        assert!(!stack.is_truncated());
        // a blocked sleep sits in a syscall, far above the null page
        assert!(stack.ips()[0] > MIN_PLAUSIBLE_ADDR);

        tracer.resume().unwrap();
        tracer.detach().unwrap();
        assert_eq!(tracer.state(), TraceState::Detached);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_frame_pointer_walk_stopped_target() {
        let mut child = spawn_target();
        let pid = Pid::from_raw(child.id() as i32);

        let mut tracer = Tracer::attach(pid).expect("attach failed");
        assert_eq!(tracer.interrupt().unwrap(), WaitOutcome::Stopped);

        let mut stack = Stack::new();
        frame_pointer_walk(pid, &mut stack).expect("register read failed");
        // whatever the chain yields, the entry frame is always there
        assert!(stack.depth() >= 1);
        assert!(stack.ips()[0] > MIN_PLAUSIBLE_ADDR);

        tracer.resume().unwrap();
        tracer.detach().unwrap();

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
