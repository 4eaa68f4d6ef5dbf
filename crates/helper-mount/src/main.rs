//! Parses one or more fstab-style mount lists and realizes every entry
//! under a target root: creating mount points, performing the bind/mount
//! dance, and applying any requested propagation.
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use caps::Capability;
use clap::Parser;
use corelib::capability::CapBracket;
use corelib::fstab::{self, FstabError};
use corelib::mountengine::{self, MountEngineError};
use corelib::syscall::{create_syscall, SyscallError};

const HELPER: &str = "mount";

#[derive(Parser, Debug)]
#[command(name = HELPER, about = "Mount fstab-style entries under a target root")]
struct Opts {
    /// Root directory mount targets are resolved under.
    #[arg(long, default_value = "/")]
    root: PathBuf,
    /// Only apply entries whose pass field matches N.
    #[arg(long)]
    pass: Option<i32>,
    /// Verbose flag (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// One or more fstab-style files, or `-` for stdin.
    #[arg(required = true)]
    fstabs: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum HelperError {
    #[error("failed to read {0}: {1}")]
    Read(String, std::io::Error),
    #[error("{0}: {1}")]
    Parse(String, FstabError),
    #[error("{0}: {1}")]
    Mount(String, MountEngineError),
    #[error("failed to raise capabilities: {0}")]
    Capability(#[from] SyscallError),
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new(default),
        ))
        .with_writer(std::io::stderr)
        .init();
}

fn read_source(name: &str) -> Result<String, HelperError> {
    let mut buf = String::new();
    if name == "-" {
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| HelperError::Read(name.to_string(), e))?;
    } else {
        let file = std::fs::File::open(name).map_err(|e| HelperError::Read(name.to_string(), e))?;
        BufReader::new(file)
            .read_to_string(&mut buf)
            .map_err(|e| HelperError::Read(name.to_string(), e))?;
    }
    Ok(buf)
}

fn run(opts: &Opts) -> Result<(), HelperError> {
    let syscall = create_syscall();
    // mount/umount2/statvfs all need CAP_SYS_ADMIN; raise it once for the
    // whole batch rather than bracketing each entry's syscalls.
    let _caps = CapBracket::raise(syscall.as_ref(), &[Capability::CAP_SYS_ADMIN])?;

    for name in &opts.fstabs {
        let content = read_source(name)?;
        let entries = fstab::parse_fstab(std::io::Cursor::new(content), opts.pass)
            .map_err(|e| HelperError::Parse(name.clone(), e))?;
        tracing::debug!(file = %name, count = entries.len(), "parsed fstab entries");
        mountengine::mount_fstab(syscall.as_ref(), Path::new(&opts.root), &entries)
            .map_err(|e| HelperError::Mount(name.clone(), e))?;
    }
    Ok(())
}

fn main() {
    let opts = Opts::parse();
    init_tracing(opts.verbose);

    if let Err(err) = run(&opts) {
        eprintln!("{HELPER}: {err}");
        std::process::exit(1);
    }
}
