// int pidfd_open(pid_t pid, unsigned int flags);
// int pidfd_getfd(int pidfd, int targetfd, unsigned int flags);

use nix::errno::Errno;
use nix::unistd::Pid;
use simple_error::bail;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::prelude::RawFd;

use crate::result::Result;

const SYS_PIDFD_GETFD: i64 = libc::SYS_pidfd_getfd;

/// Obtain a file descriptor that refers to a process as specified by its PID.
/// A PID file descriptor can be monitored using poll(2), select(2), and
/// epoll(7). When the process that it refers to terminates, these interfaces
/// indicate the file descriptor as readable. Note, however, that in the
/// current implementation, nothing can be read from the file descriptor
/// (read(2) on the file descriptor fails with the error EINVAL).
pub fn pidfd_open(pid: Pid) -> nix::Result<File> {
    let res = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    Errno::result(res).map(|r| unsafe { File::from_raw_fd(r as RawFd) })
}

/// A pidfd bound to a target process, used to duplicate file descriptors out
/// of that process' table (`pidfd_getfd(2)`, kernel >= 5.6).
pub struct PidFd {
    fd: File,
}

pub fn open(pid: Pid) -> Result<PidFd> {
    match pidfd_open(pid) {
        Ok(fd) => Ok(PidFd { fd }),
        Err(Errno::ENOSYS) => bail!("pidfd_open syscall is not supported by this kernel"),
        Err(e) => bail!("cannot open pidfd for {}: {}", pid, e),
    }
}

impl PidFd {
    /// Duplicate `target_fd`, a descriptor owned by the traced process, into
    /// our own file descriptor table.
    pub fn get_fd(&self, target_fd: RawFd) -> Result<File> {
        let res = unsafe { libc::syscall(SYS_PIDFD_GETFD, self.fd.as_raw_fd(), target_fd, 0) };
        match Errno::result(res) {
            Ok(fd) => Ok(unsafe { File::from_raw_fd(fd as RawFd) }),
            Err(Errno::ENOSYS) => {
                bail!("pidfd_getfd syscall is not supported. Please upgrade to kernel >= 5.6.")
            }
            Err(Errno::EPERM) | Err(Errno::EACCES) => {
                bail!("no permission to duplicate fd {} via pidfd_getfd", target_fd)
            }
            Err(e) => bail!("pidfd_getfd({}) failed: {}", target_fd, e),
        }
    }
}

/// Self-test: try to duplicate our own stdout. Used to detect kernels that
/// lack `pidfd_getfd` before we commit to the rest of the attach protocol.
pub fn has_capability() -> bool {
    use nix::unistd::getpid;
    use std::io::stdout;

    let pid_fd = match open(getpid()) {
        Ok(p) => p,
        Err(_) => return false,
    };
    pid_fd.get_fd(stdout().as_raw_fd()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_pidfd_open() {
        let fd = pidfd_open(getpid()).expect("cannot open pidfd for self");
        assert!(fd.as_raw_fd() >= 0);
        assert!(pidfd_open(Pid::from_raw(-1)).is_err());
    }

    #[test]
    fn test_get_fd() {
        use std::io::stdout;
        let pid_fd = open(getpid()).expect("cannot open pidfd for self");
        let dup = pid_fd
            .get_fd(stdout().as_raw_fd())
            .expect("cannot duplicate our own stdout via pidfd_getfd");
        assert!(dup.as_raw_fd() >= 0);
    }

    #[test]
    fn test_has_capability() {
        // this kernel is assumed new enough to run our own test suite
        assert!(has_capability());
    }
}
