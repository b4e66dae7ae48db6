//! Syscall Injector: stops every thread of the target, hijacks the primary
//! thread's instruction pointer with a bare `syscall` opcode, and uses that
//! to run arbitrary syscalls — including `ioctl` on descriptors that only
//! exist in the target's own file-descriptor table — inside its address
//! space. All state this module touches (code word, registers, ptrace
//! attachments) is restored on every exit path, including panics, via RAII.

use libc::{c_int, c_long, c_ulong, c_void, pid_t, SYS_getpid, SYS_gettid, SYS_ioctl};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::os::unix::prelude::RawFd;

use crate::cpu::{self, Regs};
use crate::ptrace::{self, Thread};
use crate::result::Result;

/// A scoped attach session. Dropping it restores the saved code word and
/// registers and detaches every thread, in that order, unconditionally.
pub struct Session {
    process_idx: usize,
    saved_regs: Regs,
    saved_text: c_long,
    /// `None` only transiently, while [`deinit`] is mid-flight from `Drop`.
    threads: Option<Vec<Thread>>,
}

/// Save the primary thread's registers and code word, then patch in the
/// architecture's single-instruction syscall opcode at its instruction
/// pointer.
fn init(threads: &[Thread], process_idx: usize) -> Result<(Regs, c_long)> {
    let main = &threads[process_idx];
    let saved_regs = try_with!(main.getregs(), "cannot get registers for main thread {}", main.tid);
    let ip = saved_regs.ip();
    if ip == 0 {
        bail!("main thread {} has a null instruction pointer", main.tid);
    }
    let saved_text = try_with!(main.peek(ip as *mut c_void), "cannot peek text at ip");
    try_with!(
        unsafe { main.poke(ip as *mut c_void, cpu::SYSCALL_TEXT as *mut c_void) },
        "cannot patch syscall instruction"
    );
    Ok((saved_regs, saved_text))
}

/// Reverse of `init`, run unconditionally on drop. Idempotent: a second call
/// (which can't normally happen since `threads` is taken) would be a no-op.
fn restore(main: &Thread, saved_regs: &Regs, saved_text: c_long) {
    let _ = unsafe { main.poke(saved_regs.ip() as *mut c_void, saved_text as *mut c_void) };
    let _ = main.setregs(saved_regs);
}

/// Attach to every thread of `pid` and hijack its primary thread. The
/// returned [`Session`] must be kept alive for the duration of all injected
/// syscalls; dropping it restores the target to its original state.
pub fn attach(pid: Pid) -> Result<Session> {
    let (threads, process_idx) = ptrace::attach_all_threads(pid)?;
    let (saved_regs, saved_text) = init(&threads, process_idx)?;
    Ok(Session {
        process_idx,
        saved_regs,
        saved_text,
        threads: Some(threads),
    })
}

macro_rules! syscall_args {
    ($regs:expr, $nr:expr) => {
        ($regs).prepare_syscall(&[$nr, 0, 0, 0, 0, 0, 0])
    };
    ($regs:expr, $nr:expr, $a1:expr) => {
        ($regs).prepare_syscall(&[$nr, $a1 as c_ulong as u64, 0, 0, 0, 0, 0])
    };
    ($regs:expr, $nr:expr, $a1:expr, $a2:expr) => {
        ($regs).prepare_syscall(&[$nr, $a1 as c_ulong as u64, $a2 as c_ulong as u64, 0, 0, 0, 0])
    };
    ($regs:expr, $nr:expr, $a1:expr, $a2:expr, $a3:expr) => {
        ($regs).prepare_syscall(&[
            $nr,
            $a1 as c_ulong as u64,
            $a2 as c_ulong as u64,
            $a3 as c_ulong as u64,
            0,
            0,
            0,
        ])
    };
}

impl Session {
    /// PID of the traced process (the primary thread's tid).
    pub fn pid(&self) -> Pid {
        self.main_thread().tid
    }

    /// Invoke an arbitrary syscall in the target, returning its signed
    /// return value. `nr` and every argument are widened to `u64`.
    pub fn syscall(&self, nr: u64, args: &[u64]) -> Result<isize> {
        let mut full = [0u64; 7];
        full[0] = nr;
        for (slot, arg) in full[1..].iter_mut().zip(args.iter()) {
            *slot = *arg;
        }
        let regs = self.saved_regs.prepare_syscall(&full);
        self.run(&regs)
    }

    /// `ioctl(fd, req, arg)` with the return value narrowed to `i32`, per
    /// ioctl convention.
    pub fn ioctl(&self, fd: RawFd, request: c_ulong, arg: c_ulong) -> Result<c_int> {
        let regs = syscall_args!(self.saved_regs, SYS_ioctl as u64, fd, request, arg);
        self.run(&regs).map(|v| v as c_int)
    }

    pub fn getpid(&self) -> Result<pid_t> {
        let regs = syscall_args!(self.saved_regs, SYS_getpid as u64);
        self.run(&regs).map(|v| v as pid_t)
    }

    pub fn gettid(&self) -> Result<pid_t> {
        let regs = syscall_args!(self.saved_regs, SYS_gettid as u64);
        self.run(&regs).map(|v| v as pid_t)
    }

    fn wait_for_syscall_stop(&self) -> Result<()> {
        try_with!(self.main_thread().syscall_stop(), "ptrace(PTRACE_SYSCALL) failed");
        let status = try_with!(waitpid(self.main_thread().tid, None), "waitpid failed");
        match status {
            WaitStatus::PtraceSyscall(_) | WaitStatus::Stopped(_, _) => Ok(()),
            WaitStatus::Exited(_, code) => bail!("target exited with status {} mid-injection", code),
            WaitStatus::Signaled(_, sig, _) => bail!("target was killed by {:?} mid-injection", sig),
            other => bail!("unexpected wait status during injection: {:?}", other),
        }
    }

    /// Install `regs`, run the patched instruction through syscall-enter and
    /// syscall-exit, and check that the target came back exactly where we
    /// left it.
    fn run(&self, regs: &Regs) -> Result<isize> {
        let main = self.main_thread();
        try_with!(main.setregs(regs), "cannot set syscall argument registers");
        try_with!(self.wait_for_syscall_stop(), "failed to trap before syscall");
        try_with!(self.wait_for_syscall_stop(), "failed to trap after syscall");
        let result_regs = try_with!(main.getregs(), "cannot read syscall result registers");
        // The kernel leaves the ip just past the syscall instruction;
        // `cpu::SYSCALL_SIZE` is that fixed offset, not necessarily the raw
        // opcode width (aarch64's `svc 0` is 4 bytes but the offset is 2).
        assert_eq!(
            self.saved_regs.ip(),
            result_regs.ip() - cpu::SYSCALL_SIZE,
            "instruction pointer drifted across an injected syscall"
        );
        Ok(result_regs.syscall_ret() as isize)
    }

    fn main_thread(&self) -> &Thread {
        &self.threads.as_ref().expect("session threads taken")[self.process_idx]
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(threads) = self.threads.take() {
            restore(&threads[self.process_idx], &self.saved_regs, self.saved_text);
            // dropping `threads` detaches every thread (see ptrace::Thread's Drop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::io::FromRawFd;
    use std::path::Path;
    use std::process::{Command, Stdio};

    fn compile_executable(source: &str, target: &Path) {
        let cc = std::env::var("CC").unwrap_or_else(|_| String::from("cc"));
        let mut child = Command::new(cc)
            .args(["-xc", "-", "-g", "-Wall", "-o", target.to_str().unwrap(), "-pthread"])
            .stdin(Stdio::piped())
            .spawn()
            .expect("cannot compile test helper");
        child
            .stdin
            .as_mut()
            .expect("cannot get child stdin")
            .write_all(source.as_bytes())
            .expect("cannot write source to cc stdin");
        assert!(child.wait().expect("cc did not run").success());
    }

    #[test]
    fn test_syscall_inject_single_thread() {
        let dir = tempfile::tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("main");
        compile_executable(
            r#"
#include <unistd.h>
#include <stdio.h>
int main() {
  int a;
  a = read(0, &a, sizeof(a));
  (void)a;
  puts("OK");
  return 0;
}
"#,
            &binary,
        );
        let (readfd, writefd) = pipe2(OFlag::O_CLOEXEC).expect("cannot create pipe");
        let read_end = unsafe { Stdio::from_raw_fd(readfd) };
        let write_end = unsafe { File::from_raw_fd(writefd) };
        let child = Command::new(binary)
            .stdin(read_end)
            .stdout(Stdio::piped())
            .spawn()
            .expect("test helper failed to start");
        let pid = Pid::from_raw(child.id() as i32);

        {
            let session = attach(pid).expect("cannot attach with ptrace");
            assert_eq!(session.getpid().expect("getpid failed"), pid.as_raw());
        }

        drop(write_end);
        let output = child.wait_with_output().expect("cannot read stdout").stdout;
        assert_eq!(output, b"OK\n");
    }

    #[test]
    fn test_syscall_inject_multi_thread() {
        let dir = tempfile::tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("main");
        compile_executable(
            r#"
#include <unistd.h>
#include <stdio.h>
#include <stdlib.h>
#include <pthread.h>
#include <signal.h>

static void on_term(int sig) {
  puts("OK");
  fflush(stdout);
  _exit(0);
}

static void *worker(void *arg) {
  pause();
  return NULL;
}

int main() {
  signal(SIGTERM, on_term);
  pthread_t t1, t2;
  pthread_create(&t1, NULL, worker, NULL);
  pthread_create(&t2, NULL, worker, NULL);
  sleep(1);
  fprintf(stderr, "threads started\n");
  pause();
  return 0;
}
"#,
            &binary,
        );
        let child = Command::new(binary)
            .stdout(Stdio::piped())
            .spawn()
            .expect("test helper failed to start");
        let pid = Pid::from_raw(child.id() as i32);
        std::thread::sleep(std::time::Duration::from_millis(1100));

        {
            let session = attach(pid).expect("cannot attach with ptrace");
            assert_eq!(session.gettid().expect("gettid failed"), pid.as_raw());
            assert_eq!(session.gettid().expect("gettid failed"), pid.as_raw());
        }

        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).ok();
        let output = child.wait_with_output().expect("cannot read stdout").stdout;
        assert_eq!(output, b"OK\n");
    }
}
