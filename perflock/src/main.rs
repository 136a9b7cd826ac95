// SPDX-License-Identifier: GPL-2.0

//! perflock is a locking wrapper for running benchmarks on shared
//! hosts.
//!
//! The typical use is `perflock [-shared] command...`, which acquires a
//! host-wide lock while the command runs. Exclusive mode (the default)
//! keeps every other perflock'd command off the machine and is meant
//! for benchmarks that are sensitive to their environment; shared mode
//! coexists with other shared commands and is meant for workloads that
//! would perturb benchmarks without being benchmarks themselves.
//! `--cores` additionally reserves a slice of the machine, and
//! `--governor` pins the CPU frequency for the duration of the run.
//!
//! All of this depends on the locking daemon, started with
//! `perflock --daemon`.

use std::os::unix::process::CommandExt;
use std::os::unix::process::ExitStatusExt;
use std::process::exit;
use std::process::Command;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::CommandFactory;
use clap::Parser;
use log::warn;

use perflock::daemon;
use perflock_proto::Client;
use perflock_proto::DEFAULT_SOCKET_PATH;
use perflock_utils::Cpumask;

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opts {
    /// Start the perflock daemon.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    daemon: bool,

    /// Print the current and pending lock acquisitions.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    list: bool,

    /// Acquire the lock in shared mode (default: exclusive mode).
    #[clap(long, action = clap::ArgAction::SetTrue)]
    shared: bool,

    /// How many cores to reserve; 0 reserves nothing and runs the
    /// command on every CPU it is allowed on.
    #[clap(long, default_value = "0")]
    cores: usize,

    /// Pin the CPU frequency to this point between the hardware minimum
    /// and maximum while the command runs, or "none" for no adjustment.
    /// Ignored in shared mode.
    #[clap(long, default_value = "90%", value_parser = parse_governor)]
    governor: Governor,

    /// Daemon socket path; a leading @ selects the abstract namespace.
    #[clap(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: String,

    /// Enable verbose output, useful for debugging.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Command to run under the lock.
    #[clap(trailing_var_arg = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Governor {
    None,
    Percent(u32),
}

fn parse_governor(value: &str) -> Result<Governor, String> {
    if value == "none" {
        return Ok(Governor::None);
    }
    value
        .strip_suffix('%')
        .unwrap_or(value)
        .parse::<u32>()
        .map(Governor::Percent)
        .map_err(|_| "governor must be \"none\" or \"N%\"".to_string())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    if opts.daemon {
        if !opts.command.is_empty() || opts.list {
            usage();
        }
        return daemon::run(&opts.socket);
    }

    if opts.list {
        if !opts.command.is_empty() {
            usage();
        }
        let mut client = Client::connect(&opts.socket)?;
        for line in client.list()? {
            println!("{}", line);
        }
        return Ok(());
    }

    if opts.command.is_empty() {
        usage();
    }

    let mut client = Client::connect(&opts.socket)?;
    let msg = shell_escape_list(&opts.command);

    let mut resp = client.acquire(opts.shared, true, opts.cores, &msg)?;
    if !resp.err.is_empty() {
        bail!("invalid request: {}", resp.err);
    }
    if !resp.acquired {
        eprintln!("Waiting for lock...");
        for line in client.list()? {
            eprintln!("{}", line);
        }
        resp = client.acquire(opts.shared, false, opts.cores, &msg)?;
        if !resp.err.is_empty() {
            bail!("invalid request: {}", resp.err);
        }
    }

    if !opts.shared {
        if let Governor::Percent(percent) = opts.governor {
            if let Err(e) = client.set_governor(percent) {
                warn!("setting governor: {:#}", e);
            }
        }
    }

    if opts.cores > 0 {
        let assigned = Cpumask::from_vec(resp.cores.clone());
        eprintln!("running on CPUs {}", assigned.to_cpulist());
        if let Err(e) = set_affinity(&assigned) {
            warn!("setting CPU affinity: {:#}", e);
        }
    }

    // The wrapper must outlive the command to keep the lock held, so
    // interrupts are for the child, not for us.
    ignore_signals();
    exit(run_command(&opts.command)?);
}

fn usage() -> ! {
    let mut cmd = Opts::command();
    let _ = cmd.print_help();
    exit(2);
}

/// Apply the reserved cores to this process; the command inherits the
/// mask across exec.
fn set_affinity(mask: &Cpumask) -> Result<()> {
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut cpu_set);
    }
    for cpu in mask.iter() {
        unsafe {
            libc::CPU_SET(cpu, &mut cpu_set);
        }
    }
    let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("sched_setaffinity");
    }
    Ok(())
}

fn ignore_signals() {
    use nix::sys::signal::signal;
    use nix::sys::signal::SigHandler;
    use nix::sys::signal::Signal;

    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::SigIgn);
        let _ = signal(Signal::SIGQUIT, SigHandler::SigIgn);
    }
}

/// Run the command with inherited stdio and report its exit status:
/// the command's own code, or 128+N when it died to signal N.
fn run_command(argv: &[String]) -> Result<i32> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    unsafe {
        // The wrapper ignores interrupts; the command should not.
        cmd.pre_exec(|| {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGQUIT, libc::SIG_DFL);
            Ok(())
        });
    }

    let status = cmd
        .status()
        .with_context(|| format!("running {:?}", argv[0]))?;
    if let Some(code) = status.code() {
        return Ok(code);
    }
    match status.signal() {
        Some(sig) => {
            eprintln!("{:?} killed by signal {}", argv[0], sig);
            Ok(128 + sig)
        }
        None => Ok(1),
    }
}

/// Quote a token so the queue listing reads as a runnable shell
/// command.
fn shell_escape(token: &str) -> String {
    if token.is_empty() {
        return "''".to_string();
    }
    let safe = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%_-+:,./".contains(c));
    if safe {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', "'\"'\"'"))
    }
}

fn shell_escape_list(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|token| shell_escape(token))
        .collect::<Vec<_>>()
        .join(" ")
}
