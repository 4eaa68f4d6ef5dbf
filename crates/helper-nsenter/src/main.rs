//! Joins an existing container's namespaces by pid (or, absent a target,
//! creates fresh ones exactly like `unshare`), optionally loads a clean
//! environment from a file, and execs the given command.
use std::ffi::CString;
use std::path::PathBuf;

use caps::{CapSet, Capability};
use clap::Parser;
use corelib::namespace::{self, NamespaceError, NamespaceKind};
use corelib::seccomp::{self, SeccompError};
use corelib::syscall::{create_syscall, SyscallError};
use nix::unistd::{Pid, Uid};

const HELPER: &str = "nsenter";

#[derive(Parser, Debug)]
#[command(name = HELPER, about = "Join or create namespaces and exec a command in them")]
struct Opts {
    /// Join the namespaces of this pid instead of creating new ones.
    #[arg(long)]
    target: Option<i32>,
    #[arg(long)]
    user: bool,
    #[arg(long)]
    mount: bool,
    #[arg(long)]
    remap_root: bool,
    /// Replace the environment with the `KEY=VAL` lines in this file.
    #[arg(long)]
    envfile: Option<PathBuf>,
    /// Change directory before exec'ing the command.
    #[arg(long)]
    workdir: Option<PathBuf>,
    #[arg(long)]
    allow_speculation: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
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
    #[error("failed to read environment file {0:?}: {1}")]
    EnvFile(PathBuf, std::io::Error),
    #[error("failed to chdir into {0:?}: {1}")]
    Chdir(PathBuf, nix::errno::Errno),
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

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Clears the current environment and populates it from `path`'s
/// `KEY=VAL` lines, skipping any line whose key isn't a valid identifier.
fn load_environment(path: &std::path::Path) -> Result<(), HelperError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| HelperError::EnvFile(path.to_path_buf(), e))?;

    for (key, _) in std::env::vars() {
        std::env::remove_var(key);
    }

    for line in content.lines() {
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        if is_valid_env_name(key) {
            std::env::set_var(key, val);
        } else {
            tracing::warn!(key, "skipping invalid environment variable name");
        }
    }
    Ok(())
}

/// Best-effort `close_range`-equivalent: closes every open fd above stderr
/// so the exec'd command doesn't inherit anything this helper held open
/// (namespace fds, the envfile, ...).
fn close_fds_above_stderr() {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    for entry in entries.flatten() {
        if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            if fd > 2 {
                let _ = nix::unistd::close(fd);
            }
        }
    }
}

fn join_target(syscall: &dyn corelib::syscall::Syscall, pid: Pid, opts: &Opts) -> Result<(), HelperError> {
    if opts.user {
        namespace::join_namespace(syscall, pid, NamespaceKind::User)?;
    }
    if opts.mount {
        namespace::join_namespace(syscall, pid, NamespaceKind::Mount)?;
    }
    namespace::join_namespace(syscall, pid, NamespaceKind::Cgroup)?;
    Ok(())
}

fn create_fresh(syscall: &dyn corelib::syscall::Syscall, opts: &Opts) -> Result<(), HelperError> {
    if opts.user {
        let remap_root = opts.remap_root.then_some(Uid::from_raw(0));
        namespace::unshare_user_ns(syscall, remap_root)?;
    }
    if opts.mount {
        namespace::unshare_mount_ns(syscall)?;
    }
    if opts.user && !opts.remap_root {
        let effective = caps::read(None, CapSet::Effective).unwrap_or_default();
        let effective: Vec<Capability> = effective.into_iter().collect();
        namespace::raise_ambient_capabilities(syscall, &effective).map_err(|err| match err {
            NamespaceError::Syscall(source) => HelperError::AmbientCapabilities(source),
            other => HelperError::Namespace(other),
        })?;
    }
    Ok(())
}

fn run(opts: &Opts) -> Result<(), HelperError> {
    let syscall = create_syscall();

    match opts.target {
        Some(pid) => join_target(syscall.as_ref(), Pid::from_raw(pid), opts)?,
        None => create_fresh(syscall.as_ref(), opts)?,
    }

    // Installed whenever `--user` was requested, whether this process just
    // created a fresh user namespace or joined an existing target's.
    if opts.user {
        seccomp::install_id_spoof_filter()?;
    }

    if opts.allow_speculation {
        namespace::disable_speculation_mitigations()?;
    }

    if let Some(envfile) = &opts.envfile {
        load_environment(envfile)?;
    }
    if let Some(workdir) = &opts.workdir {
        nix::unistd::chdir(workdir).map_err(|e| HelperError::Chdir(workdir.clone(), e))?;
    }

    close_fds_above_stderr();

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
