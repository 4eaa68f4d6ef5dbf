//! Unshares a user and/or mount namespace and execs the given command
//! inside it, the way an unprivileged caller bootstraps a rootless
//! container without needing `CAP_SYS_ADMIN` on the host.
use std::ffi::CString;

use caps::{CapSet, Capability};
use clap::Parser;
use corelib::namespace::{self, NamespaceError};
use corelib::seccomp::{self, SeccompError};
use corelib::syscall::{create_syscall, SyscallError};
use nix::unistd::Uid;

const HELPER: &str = "unshare";

#[derive(Parser, Debug)]
#[command(name = HELPER, about = "Unshare a namespace and exec a command in it")]
struct Opts {
    /// Create a new user namespace.
    #[arg(long)]
    user: bool,
    /// Create a new mount namespace.
    #[arg(long)]
    mount: bool,
    /// Map root (uid 0) into the new user namespace instead of the caller.
    #[arg(long)]
    remap_root: bool,
    /// Disable speculative-execution mitigations for this process tree.
    #[arg(long)]
    allow_speculation: bool,
    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Command to exec once the namespace is set up.
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum HelperError {
    #[error("namespace setup failed: {0}")]
    Namespace(#[from] NamespaceError),
    #[error(
        "failed to raise ambient capabilities: {0} (hint: pass --remap-root if this kernel \
         doesn't support PR_CAP_AMBIENT)"
    )]
    AmbientCapabilities(SyscallError),
    #[error("failed to install seccomp filter: {0}")]
    Seccomp(#[from] SeccompError),
    #[error("command contained an interior NUL byte: {0}")]
    InvalidArg(#[from] std::ffi::NulError),
    #[error("failed to exec {0:?}: {1}")]
    Exec(String, nix::errno::Errno),
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

fn run(opts: &Opts) -> Result<(), HelperError> {
    let syscall = create_syscall();

    if opts.user {
        let remap_root = opts.remap_root.then_some(Uid::from_raw(0));
        namespace::unshare_user_ns(syscall.as_ref(), remap_root)?;
    }
    if opts.mount {
        namespace::unshare_mount_ns(syscall.as_ref())?;
    }

    if opts.user && !opts.remap_root {
        let effective = caps::read(None, CapSet::Effective).unwrap_or_default();
        let effective: Vec<Capability> = effective.into_iter().collect();
        namespace::raise_ambient_capabilities(syscall.as_ref(), &effective)
            .map_err(|err| match err {
                NamespaceError::Syscall(source) => HelperError::AmbientCapabilities(source),
                other => HelperError::Namespace(other),
            })?;
    }
    if opts.user {
        seccomp::install_id_spoof_filter()?;
    }

    if opts.allow_speculation {
        namespace::disable_speculation_mitigations()?;
    }

    let argv: Vec<CString> = opts
        .command
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<_, _>>()?;
    let err = nix::unistd::execvp(&argv[0], &argv).unwrap_err();
    Err(HelperError::Exec(opts.command[0].clone(), err))
}

fn main() {
    let opts = Opts::parse();
    init_tracing(opts.verbose);

    if let Err(err) = run(&opts) {
        eprintln!("{HELPER}: {err}");
        std::process::exit(1);
    }
}
