//! Proc View: per-PID file-descriptor enumeration and `/proc/<pid>/maps`
//! parsing. Everything here reads `/proc` once per call and returns owned,
//! immutable records — there is no live handle into the kernel beyond the
//! directory descriptor kept open in [`PidHandle`].

use libc::c_int;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::unistd::{getpid, Pid};
use simple_error::try_with;
use std::fs::{read_dir, read_link, File};
use std::io::{BufRead, BufReader};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::prelude::RawFd;
use std::path::PathBuf;

use crate::result::Result;

/// A contiguous VA range in the target's address space, as parsed from one
/// line of `/proc/<pid>/maps`. `phys_addr` is zero unless this mapping has
/// been refined into a [`crate::kvm::memslots::MemSlot`]-backed GuestMapping.
#[derive(Clone, Debug, PartialEq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    pub prot_flags: ProtFlags,
    pub map_flags: MapFlags,
    pub offset: u64,
    pub major_dev: u64,
    pub minor_dev: u64,
    pub inode: u64,
    pub pathname: String,

    /// guest-physical origin of this mapping; zero for plain host mappings.
    pub phys_addr: usize,
}

impl Mapping {
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

/// Linear scan for the mapping containing `addr`. There is at most one,
/// since `/proc/<pid>/maps` lines never overlap.
pub fn find_mapping(mappings: &[Mapping], addr: usize) -> Option<Mapping> {
    mappings
        .iter()
        .find(|m| m.start <= addr && addr < m.end)
        .cloned()
}

/// Scoped handle on `/proc/<pid>`, kept open via `O_PATH` so that later
/// lookups go through `/proc/self/fd/<handle>/...` instead of `/proc/<pid>/...`
/// directly — this closes the window where `pid` gets reused by a new
/// process between opening the handle and reading through it.
pub struct PidHandle {
    pub pid: Pid,
    file: File,
}

pub fn pid_path(pid: Pid) -> PathBuf {
    PathBuf::from("/proc").join(pid.as_raw().to_string())
}

pub fn openpid(pid: Pid) -> Result<PidHandle> {
    use nix::fcntl::{self, OFlag};
    use nix::sys::stat;

    let path = pid_path(pid);
    let fd = try_with!(
        fcntl::open(
            &path,
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            stat::Mode::empty(),
        ),
        "failed to open: {}",
        path.display()
    );
    let file = unsafe { File::from_raw_fd(fd) };

    Ok(PidHandle { pid, file })
}

fn parse_flags(fields: &[u8]) -> (ProtFlags, MapFlags) {
    assert!(fields.len() == 4);
    (
        (if fields[0] == b'r' {
            ProtFlags::PROT_READ
        } else {
            ProtFlags::empty()
        }) | (if fields[1] == b'w' {
            ProtFlags::PROT_WRITE
        } else {
            ProtFlags::empty()
        }) | (if fields[2] == b'x' {
            ProtFlags::PROT_EXEC
        } else {
            ProtFlags::empty()
        }),
        if fields[3] == b'p' {
            MapFlags::MAP_PRIVATE
        } else {
            MapFlags::MAP_SHARED
        },
    )
}

fn parse_line(line: &str) -> Result<Mapping> {
    let fields = line.splitn(6, ' ').collect::<Vec<_>>();
    let range = fields[0].splitn(2, '-').collect::<Vec<_>>();

    let start = try_with!(
        usize::from_str_radix(range[0], 16),
        "start address is not a number: {}",
        range[0]
    );
    let end = try_with!(
        usize::from_str_radix(range[1], 16),
        "end address is not a number: {}",
        range[1]
    );
    let (prot_flags, map_flags) = parse_flags(fields[1].as_bytes());
    let offset = try_with!(
        u64::from_str_radix(fields[2], 16),
        "offset is not a number: {}",
        fields[2]
    );
    let dev = fields[3].splitn(2, ':').collect::<Vec<_>>();
    let major_dev = try_with!(
        u64::from_str_radix(dev[0], 16),
        "major dev is not a number: {}",
        dev[0]
    );
    let minor_dev = try_with!(
        u64::from_str_radix(dev[1], 16),
        "minor dev is not a number: {}",
        dev[1]
    );
    let inode = try_with!(
        fields[4].parse::<u64>(),
        "inode is not a number: {}",
        fields[4]
    );
    // only strip leading whitespace and a trailing newline, matching
    // kvm_pirate's proc.py — inner whitespace in a pathname is preserved.
    let stripped = fields[5].trim_start();
    let pathname = stripped.strip_suffix('\n').unwrap_or(stripped).to_string();

    Ok(Mapping {
        start,
        end,
        prot_flags,
        map_flags,
        offset,
        major_dev,
        minor_dev,
        inode,
        pathname,
        phys_addr: 0,
    })
}

/// One entry of `/proc/<pid>/fd`: the local fd number and the symlink target
/// (e.g. `anon_inode:kvm-vm`, `/dev/null`, a regular file path).
pub struct ProcFd {
    pub fd_num: RawFd,
    pub path: PathBuf,
}

impl PidHandle {
    fn entry(&self, name: &str) -> PathBuf {
        pid_path(getpid())
            .join("fd")
            .join(self.file.as_raw_fd().to_string())
            .join(name)
    }

    /// Finite, non-restartable snapshot of the target's open file descriptors.
    pub fn fds(&self) -> Result<Vec<ProcFd>> {
        let path = self.entry("fd");
        let mut fds = vec![];
        let entries = try_with!(read_dir(&path), "failed to read {}", path.display());
        for maybe_entry in entries {
            let entry = try_with!(maybe_entry, "failed to read {}", path.display());
            let file_name = entry.file_name();
            let target = if let Ok(res) = read_link(entry.path()) {
                res
            } else {
                // descriptor might have been closed again between scandir and readlink
                continue;
            };
            let fd_num = try_with!(
                file_name
                    .to_str()
                    .unwrap_or("")
                    .parse::<c_int>(),
                "not a valid fd number: {}",
                PathBuf::from(file_name).display()
            );
            fds.push(ProcFd {
                fd_num,
                path: target,
            });
        }
        Ok(fds)
    }

    pub fn maps(&self) -> Result<Vec<Mapping>> {
        let path = self.entry("maps");
        let f = try_with!(File::open(&path), "cannot open {}", path.display());
        let buf = BufReader::new(f);
        let mut maps = vec![];
        for line in buf.lines() {
            let line = try_with!(line, "cannot read from {}", path.display());
            maps.push(try_with!(parse_line(&line), "cannot parse line {}", line));
        }
        Ok(maps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_maps_contains_local_var() {
        let handle = openpid(getpid()).expect("cannot open /proc/self");
        let mappings = handle.maps().expect("cannot parse /proc/self/maps");
        let local_var = 0u64;
        let addr = &local_var as *const u64 as usize;
        let found = find_mapping(&mappings, addr).expect("stack mapping not found");
        assert!(found.prot_flags.contains(ProtFlags::PROT_READ));
        assert!(found.prot_flags.contains(ProtFlags::PROT_WRITE));
        assert_eq!(found.map_flags, MapFlags::MAP_PRIVATE);
    }

    #[test]
    fn test_find_mapping_none_outside_ranges() {
        let mappings = vec![Mapping {
            start: 0x1000,
            end: 0x2000,
            prot_flags: ProtFlags::PROT_READ,
            map_flags: MapFlags::MAP_PRIVATE,
            offset: 0,
            major_dev: 0,
            minor_dev: 0,
            inode: 0,
            pathname: String::new(),
            phys_addr: 0,
        }];
        assert!(find_mapping(&mappings, 0x500).is_none());
        assert!(find_mapping(&mappings, 0x1500).is_some());
        assert!(find_mapping(&mappings, 0x2000).is_none());
    }

    #[test]
    fn test_fds_nonempty_for_self() {
        let handle = openpid(getpid()).expect("cannot open /proc/self");
        assert!(!handle.fds().expect("cannot list fds").is_empty());
    }
}
