use clap::{crate_authors, crate_version, value_t, App, AppSettings, Arg, ArgMatches, SubCommand};
use nix::unistd::Pid;

use simple_error::bail;

use kvm_pirate::kvm::discovery;
use kvm_pirate::kvm::{memslots, tracee::Tracee};
use kvm_pirate::proc::Mapping;
use kvm_pirate::result::Result;
use kvm_pirate::{coredump, pidfd};

fn pid_arg(index: u64) -> Arg<'static, 'static> {
    Arg::with_name("pid")
        .help("Pid of the hypervisor we get the information from")
        .required(true)
        .index(index)
}

fn parse_pid_arg(args: &ArgMatches) -> Pid {
    let pid = value_t!(args, "pid", i32).unwrap_or_else(|e| e.exit());
    Pid::from_raw(pid)
}

/// Discover, scoped-attach, run the memslot probe, and release — the flow
/// shared by every subcommand.
fn fetch_guest_mappings(pid: Pid) -> Result<Option<Vec<Mapping>>> {
    let hv = match discovery::discover(pid)? {
        Some(hv) => hv,
        None => return Ok(None),
    };

    let mut tracee = Tracee::new(hv.pid, hv.vm_fd);
    tracee.attach()?;
    let maps = memslots::get_maps(&tracee);
    tracee.detach();
    Ok(Some(maps?))
}

fn inspect(args: &ArgMatches) -> Result<()> {
    let pid = parse_pid_arg(args);
    match fetch_guest_mappings(pid)? {
        None => bail!("No kvm instance found for pid {}", pid),
        Some(maps) => {
            for map in &maps {
                println!("vm mem: {:#x} -> {:#x} (physical {:#x})", map.start, map.end, map.phys_addr);
            }
            Ok(())
        }
    }
}

fn coredump(args: &ArgMatches) -> Result<()> {
    let pid = parse_pid_arg(args);
    match fetch_guest_mappings(pid)? {
        None => bail!("No kvm instance found for pid {}", pid),
        Some(maps) => coredump::generate_coredump(pid, &maps),
    }
}

fn main() {
    env_logger::init();

    if !pidfd::has_capability() {
        eprintln!("pidfd_getfd is not supported on this kernel; cannot run");
        std::process::exit(1);
    }

    let inspect_command = SubCommand::with_name("inspect")
        .about("Inspect a virtual machine.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(pid_arg(1));

    let coredump_command = SubCommand::with_name("coredump")
        .about("Get a coredump of a virtual machine.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(pid_arg(1));

    let main_app = App::new("kvm-pirate")
        .about("External KVM introspection and ELF coredumps, without hypervisor cooperation.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(inspect_command)
        .subcommand(coredump_command);

    let matches = main_app.get_matches();
    let result = match matches.subcommand() {
        ("inspect", Some(sub_matches)) => inspect(sub_matches),
        ("coredump", Some(sub_matches)) => coredump(sub_matches),
        ("", None) => unreachable!(), // because of AppSettings::SubcommandRequiredElseHelp
        _ => unreachable!(),
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
