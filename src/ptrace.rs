//! Ptrace Wrapper: a thin, checked interface over the kernel's tracing
//! primitive. Every request that can fail is surfaced as a crate [`Result`]
//! instead of a raw `errno`.

use libc::{c_long, c_void, pid_t};
use nix::errno::Errno;
use nix::sys::ptrace::{self, AddressType, Request, RequestType};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use simple_error::try_with;
use std::fs;
use std::{mem, ptr};

use crate::cpu::Regs;
use crate::proc;
use crate::result::Result;

#[derive(Debug)]
pub struct Thread {
    pub tid: Pid,
}

fn getregs(pid: Pid) -> nix::Result<Regs> {
    ptrace_get_data::<Regs>(Request::PTRACE_GETREGS, pid)
}

fn setregs(pid: Pid, regs: &Regs) -> nix::Result<()> {
    let res = unsafe {
        libc::ptrace(
            Request::PTRACE_SETREGS as RequestType,
            libc::pid_t::from(pid),
            ptr::null_mut::<c_void>(),
            regs as *const _ as *const c_void,
        )
    };
    Errno::result(res).map(drop)
}

/// Stop the tracee while attached, as with `ptrace(PTRACE_INTERRUPT, ...)`.
fn interrupt(pid: Pid) -> nix::Result<()> {
    let res = unsafe {
        libc::ptrace(
            Request::PTRACE_INTERRUPT as RequestType,
            libc::pid_t::from(pid),
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    Errno::result(res).map(drop)
}

/// Some ptrace GET requests populate a struct through the `data` pointer
/// rather than returning a `c_long` directly; this covers those.
fn ptrace_get_data<T>(request: Request, pid: Pid) -> nix::Result<T> {
    let mut data = mem::MaybeUninit::uninit();
    let res = unsafe {
        libc::ptrace(
            request as RequestType,
            libc::pid_t::from(pid),
            ptr::null_mut::<T>(),
            data.as_mut_ptr() as *const _ as *const c_void,
        )
    };
    Errno::result(res)?;
    Ok(unsafe { data.assume_init() })
}

impl Thread {
    pub fn setregs(&self, regs: &Regs) -> Result<()> {
        try_with!(setregs(self.tid, regs), "cannot set registers with ptrace");
        Ok(())
    }

    pub fn getregs(&self) -> Result<Regs> {
        Ok(try_with!(
            getregs(self.tid),
            "cannot get registers with ptrace"
        ))
    }

    pub fn detach(&self) -> Result<()> {
        try_with!(
            ptrace::detach(self.tid, None),
            "cannot detach process from ptrace"
        );
        Ok(())
    }

    pub fn cont(&self) -> Result<()> {
        try_with!(
            ptrace::cont(self.tid, None),
            "cannot continue tracee with ptrace"
        );
        Ok(())
    }

    /// Continue with `PTRACE_SYSCALL` semantics: the tracee stops again at
    /// the next syscall-enter or syscall-exit boundary.
    pub fn syscall_stop(&self) -> Result<()> {
        try_with!(
            ptrace::syscall(self.tid, None),
            "cannot continue tracee to next syscall stop"
        );
        Ok(())
    }

    pub fn peek(&self, addr: AddressType) -> Result<c_long> {
        Ok(try_with!(
            ptrace::read(self.tid, addr),
            "cannot peek with ptrace"
        ))
    }

    /// # Safety
    ///
    /// `data` is passed straight to `ptrace(2)`'s `PTRACE_POKETEXT`; callers
    /// must pass a full, alignment-respecting machine word.
    pub unsafe fn poke(&self, addr: AddressType, data: *mut c_void) -> Result<()> {
        try_with!(ptrace::write(self.tid, addr, data), "cannot poke with ptrace");
        Ok(())
    }
}

/// `PTRACE_SEIZE` + `PTRACE_INTERRUPT`: seize is more versatile than the
/// classic `PTRACE_ATTACH` (no SIGSTOP is delivered to the tracee, and we can
/// continue/stop/detach at almost any time).
pub fn attach_seize(tid: Pid) -> Result<()> {
    try_with!(
        ptrace::seize(tid, ptrace::Options::PTRACE_O_TRACESYSGOOD),
        "cannot seize the process"
    );
    try_with!(interrupt(tid), "cannot interrupt/stop the tracee");
    try_with!(waitpid(tid, Some(WaitPidFlag::WSTOPPED)), "waitpid failed");
    Ok(())
}

/// Attach to every thread under `/proc/<pid>/task`, per spec: the whole
/// process must be stopped before any register manipulation on one thread.
/// Returns the attached threads and the index of the primary thread (`pid`
/// itself) within that vector.
pub fn attach_all_threads(pid: Pid) -> Result<(Vec<Thread>, usize)> {
    let dir = proc::pid_path(pid).join("task");
    let threads_dir = try_with!(
        fs::read_dir(&dir),
        "failed to open directory {}",
        dir.display()
    );
    let mut process_idx = 0;
    let mut threads = vec![];

    for (i, thread_name) in threads_dir.enumerate() {
        let entry = try_with!(thread_name, "failed to read directory {}", dir.display());
        let file_name = entry.file_name();
        let file_name = try_with!(
            file_name.to_str().ok_or(()),
            "invalid utf8 task entry {:?}",
            file_name
        );
        let raw_tid = try_with!(file_name.parse::<pid_t>(), "invalid tid {}", file_name);
        let tid = Pid::from_raw(raw_tid);
        if tid == pid {
            process_idx = i;
        }
        if attach_seize(tid).is_ok() {
            threads.push(Thread { tid });
        }
    }
    Ok((threads, process_idx))
}

impl Drop for Thread {
    fn drop(&mut self) {
        match ptrace::detach(self.tid, None) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => log::warn!("cannot ptrace::detach from {}: {}", self.tid, e),
        };
    }
}
