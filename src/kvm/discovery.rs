//! KVM Discovery: recognises KVM VM and vCPU anonymous inodes among a
//! target's open descriptors and assembles a [`Hypervisor`] handle.

use log::info;
use nix::unistd::Pid;
use simple_error::bail;
use std::os::unix::prelude::RawFd;

use crate::proc::{self, Mapping, ProcFd};
use crate::result::Result;

pub const VMFD_INODE_NAME: &str = "anon_inode:kvm-vm";
pub const VCPUFD_INODE_NAME_STARTS_WITH: &str = "anon_inode:kvm-vcpu:";

/// A single vCPU descriptor as seen in the target's fd table, tagged with
/// its vCPU index.
#[derive(Clone, Copy, Debug)]
pub struct Vcpu {
    pub id: usize,
    pub fd_num: RawFd,
}

/// Aggregates everything discovery found about one hypervisor process: the
/// target PID, its single VM descriptor, its vCPUs ordered by ascending id,
/// and a Region snapshot captured at discovery time.
pub struct Hypervisor {
    pub pid: Pid,
    pub vm_fd: RawFd,
    pub vcpus: Vec<Vcpu>,
    pub regions: Vec<Mapping>,
}

/// Classifies an already-collected fd listing. Kept separate from
/// [`PidHandle::fds`] so the duplicate-vcpu rejection can be exercised
/// against a synthetic listing without a real KVM instance.
fn classify(pid: Pid, fds: &[ProcFd]) -> Result<(Vec<RawFd>, Vec<Vcpu>)> {
    let mut vm_fds = vec![];
    let mut vcpus: Vec<Vcpu> = vec![];

    for fd in fds {
        let name = match fd.path.file_name().and_then(|s| s.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name == VMFD_INODE_NAME {
            vm_fds.push(fd.fd_num);
        } else if let Some(idx_str) = name.strip_prefix(VCPUFD_INODE_NAME_STARTS_WITH) {
            let id = match idx_str.parse::<usize>() {
                Ok(id) => id,
                Err(_) => continue,
            };
            if vcpus.iter().any(|v| v.id == id) {
                bail!("multiple vcpus with same id {} in pid {}", id, pid);
            }
            info!("vcpu {} fd {}", id, fd.fd_num);
            vcpus.push(Vcpu { id, fd_num: fd.fd_num });
        }
    }

    vcpus.sort_unstable_by_key(|v| v.id);
    Ok((vm_fds, vcpus))
}

/// Scans `pid`'s open descriptors and assembles a [`Hypervisor`]. Returns
/// `Ok(None)` when the target holds no KVM VM descriptor at all — that is an
/// informational "no instance" outcome, not an error.
pub fn discover(pid: Pid) -> Result<Option<Hypervisor>> {
    let handle = proc::openpid(pid)?;
    let (vm_fds, vcpus) = classify(pid, &handle.fds()?)?;

    if vm_fds.is_empty() {
        return Ok(None);
    }
    if vm_fds.len() > 1 {
        bail!("multiple VMs found in pid {}, this is not supported", pid);
    }
    if vcpus.is_empty() {
        bail!("VM in pid {} has no vcpus", pid);
    }

    let regions = handle.maps()?;
    Ok(Some(Hypervisor {
        pid,
        vm_fd: vm_fds[0],
        vcpus,
        regions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fd(num: RawFd, name: &str) -> ProcFd {
        ProcFd {
            fd_num: num,
            path: PathBuf::from(name),
        }
    }

    /// T6: a synthetic fd table with two descriptors claiming vcpu id 0 is
    /// rejected by `classify` itself, not just by a hand-built `Vec<Vcpu>`.
    #[test]
    fn test_classify_duplicate_vcpu_rejected() {
        let fds = vec![
            fd(3, VMFD_INODE_NAME),
            fd(4, "anon_inode:kvm-vcpu:0"),
            fd(5, "anon_inode:kvm-vcpu:0"),
        ];
        let err = classify(Pid::from_raw(1234), &fds).expect_err("duplicate vcpu id must be rejected");
        assert!(err.to_string().contains("multiple vcpus with same id"));
    }

    #[test]
    fn test_classify_sorts_vcpus_by_id() {
        let fds = vec![
            fd(3, VMFD_INODE_NAME),
            fd(4, "anon_inode:kvm-vcpu:2"),
            fd(5, "anon_inode:kvm-vcpu:0"),
            fd(6, "anon_inode:kvm-vcpu:1"),
        ];
        let (vm_fds, vcpus) = classify(Pid::from_raw(1234), &fds).expect("classification should succeed");
        assert_eq!(vm_fds, vec![3]);
        assert_eq!(vcpus.iter().map(|v| v.id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_classify_ignores_unrelated_fds() {
        let fds = vec![fd(3, "/dev/null"), fd(4, "socket:[12345]")];
        let (vm_fds, vcpus) = classify(Pid::from_raw(1234), &fds).expect("classification should succeed");
        assert!(vm_fds.is_empty());
        assert!(vcpus.is_empty());
    }

    /// T4: discovery against a process with no KVM fds at all returns
    /// `Ok(None)` rather than an error. Our own test process is such a
    /// process, so this is safe to run without any special privilege.
    #[test]
    #[ignore = "reads /proc/self/fd on the live test process; run explicitly"]
    fn test_discover_returns_none_for_non_kvm_pid() {
        let hv = discover(nix::unistd::getpid()).expect("discover must not error for a non-kvm process");
        assert!(hv.is_none());
    }
}
