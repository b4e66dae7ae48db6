//! `Tracee`: a transient handle valid only inside a scoped attach, binding a
//! [`crate::kvm::discovery::Hypervisor`] to an attached [`inject_syscall::Session`].
//! All KVM ioctls flow through here; the VM descriptor number carried inside
//! is only meaningful in the target's own file-descriptor table and must
//! never be used with a local `ioctl(2)`.

use libc::{c_int, c_ulong};
use nix::unistd::Pid;
use simple_error::bail;
use std::os::unix::prelude::RawFd;

use crate::inject_syscall::{self, Session};
use crate::kvm::ioctls::KVM_CHECK_EXTENSION;
use crate::result::Result;

pub struct Tracee {
    pid: Pid,
    vm_fd: RawFd,
    session: Option<Session>,
}

impl Tracee {
    pub fn new(pid: Pid, vm_fd: RawFd) -> Tracee {
        Tracee {
            pid,
            vm_fd,
            session: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Attach to every thread of the target. The target stays stopped until
    /// `detach` is called or this `Tracee` (or the returned guard) is
    /// dropped.
    pub fn attach(&mut self) -> Result<()> {
        if self.session.is_none() {
            self.session = Some(inject_syscall::attach(self.pid)?);
        }
        Ok(())
    }

    pub fn detach(&mut self) {
        self.session = None;
    }

    fn session(&self) -> Result<&Session> {
        match &self.session {
            Some(s) => Ok(s),
            None => bail!("tracee is not attached; call attach() first"),
        }
    }

    /// Issue an ioctl on the VM descriptor, routed through the syscall
    /// injector running inside the target.
    pub fn vm_ioctl(&self, request: c_ulong, arg: c_ulong) -> Result<c_int> {
        self.session()?.ioctl(self.vm_fd, request, arg)
    }

    /// `KVM_CHECK_EXTENSION` is the one ioctl the probe protocol uses to
    /// trip `kvm_vm_ioctl` inside the target's kernel. `cap` 0 is
    /// deliberately benign (`KVM_CAP_IRQCHIP`/no-op on most kernels).
    pub fn check_extension(&self, cap: c_int) -> Result<c_int> {
        self.vm_ioctl(KVM_CHECK_EXTENSION(), cap as c_ulong)
    }
}
