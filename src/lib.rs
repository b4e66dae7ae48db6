#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

pub mod coredump;
pub mod cpu;
pub mod elf;
pub mod inject_syscall;
pub mod kvm;
pub mod page_math;
pub mod pidfd;
pub mod proc;
pub mod ptrace;
pub mod result;
