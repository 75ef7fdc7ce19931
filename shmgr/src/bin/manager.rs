//! Shared-memory manager daemon.
//!
//! Owns the segment table for every process using the `shmgr` client library
//! on this host.
//!
//! # Usage
//!
//! ```sh
//! shmgr-manager --foreground --socket /tmp/shmgr.sock
//! shmgr-manager --daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (backing objects and the socket
//!   file are removed)

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use shmgr::manager::{Manager, ManagerConfig, ManagerError};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("failed to start daemon: {0}")]
    Daemon(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Foreground,
    Daemon,
}

fn main() {
    shmgr::init_tracing();

    if let Err(e) = run() {
        eprintln!("shmgr-manager: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let (mode, config) = parse_args(&args)?;

    match mode {
        Mode::Daemon => daemonize(&args),
        Mode::Foreground => foreground(config),
    }
}

fn foreground(config: ManagerConfig) -> Result<(), CliError> {
    // Blocked before the dispatch thread exists so it inherits the mask and
    // only `sigwait` below sees these signals.
    let signals = block_shutdown_signals();

    eprintln!(
        "shmgr-manager: listening on {}",
        config.socket_path.display()
    );
    let manager = Manager::spawn(config)?;
    eprintln!("shmgr-manager: ready");

    let signal = wait_for_signal(&signals);
    eprintln!("shmgr-manager: received signal {signal}, shutting down...");
    manager.shutdown();
    eprintln!("shmgr-manager: stopped");
    Ok(())
}

/// Re-executes this binary in the foreground mode, detached into its own
/// process group with null stdio.
fn daemonize(args: &[String]) -> Result<(), CliError> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()?;
    let child_args = args
        .iter()
        .skip(1)
        .map(|arg| match arg.as_str() {
            "--daemon" | "-d" => "--foreground",
            other => other,
        });

    let child = Command::new(exe)
        .args(child_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    eprintln!("shmgr-manager: started daemon (pid {})", child.id());
    Ok(())
}

fn block_shutdown_signals() -> libc::sigset_t {
    // SAFETY: `set` is initialized by `sigemptyset` before use, and
    // `pthread_sigmask` only reads it.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        set
    }
}

fn wait_for_signal(set: &libc::sigset_t) -> libc::c_int {
    let mut signal = 0;
    loop {
        // SAFETY: `set` is a valid signal set and `signal` a valid out slot.
        if unsafe { libc::sigwait(set, &mut signal) } == 0 {
            return signal;
        }
    }
}

/// Parses command line arguments into a mode and a ManagerConfig.
fn parse_args(args: &[String]) -> Result<(Mode, ManagerConfig), CliError> {
    let mut mode = Mode::Foreground;
    let mut config = ManagerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--foreground" | "-f" => mode = Mode::Foreground,
            "--daemon" | "-d" => mode = Mode::Daemon,
            "--socket" | "-s" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| CliError::Usage("missing value for --socket".into()))?;
                config.socket_path = PathBuf::from(value);
            }
            "--max-segments" | "-m" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| CliError::Usage("missing value for --max-segments".into()))?;
                config.max_segments = value
                    .parse()
                    .map_err(|e| CliError::Usage(format!("invalid --max-segments: {e}")))?;
                if config.max_segments == 0 {
                    return Err(CliError::Usage("--max-segments must be positive".into()));
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok((mode, config))
}

fn print_usage() {
    eprintln!(
        r#"shmgr-manager - shared memory segment manager

USAGE:
    shmgr-manager [OPTIONS]

OPTIONS:
    -f, --foreground          Run in the foreground (default)
    -d, --daemon              Detach and run in the background
    -s, --socket <PATH>       Socket path (default: $SHMGR_SOCKET or /tmp/shmgr.sock)
    -m, --max-segments <N>    Maximum number of live segments (default: 4096)
    -h, --help                Print this help message

SIGNALS:
    SIGTERM, SIGINT           Graceful shutdown

ENVIRONMENT:
    SHMGR_SOCKET              Default socket path
    RUST_LOG                  Log filter with --features tracing (default: shmgr=info)
"#
    );
}
