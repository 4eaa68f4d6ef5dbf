//! Pivots the calling process into a new root filesystem, drops every
//! privilege it was holding, and execs either the given command directly
//! or (with `--login`) a full login shell after populating its
//! environment from `/etc/login.defs`.
use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use clap::Parser;
use corelib::capability::{self, CapabilityError};
use corelib::login::{self, ParamMap};
use corelib::syscall::{create_syscall, SyscallError};
use nix::sched::CloneFlags;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::stat::{umask, Mode};

const HELPER: &str = "switchroot";

#[derive(Parser, Debug)]
#[command(name = HELPER, about = "Pivot into a new root and exec an init/login shell")]
struct Opts {
    /// Run the full login/init procedure (§4.5.1) before exec'ing a shell.
    #[arg(long)]
    login: bool,
    /// Replace the environment with the `KEY=VAL` lines in this file.
    #[arg(long)]
    env: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// The new root filesystem.
    rootfs: PathBuf,
    /// Command to exec once switched; defaults to a login shell under
    /// `--login`, or `/bin/sh` otherwise.
    command: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum HelperError {
    #[error("failed to read environment file {0:?}: {1}")]
    EnvFile(PathBuf, std::io::Error),
    #[error("failed to read cap_last_cap: {0}")]
    CapLastCap(CapabilityError),
    #[error("failed to switch root to {0:?}: {1}")]
    SwitchRoot(PathBuf, SyscallError),
    #[error("failed to chroot after pivot: {0}")]
    Chroot(SyscallError),
    #[error("failed to drop privileges: {0}")]
    DropPrivileges(CapabilityError),
    #[error("failed to chdir into {0:?}: {1}")]
    Chdir(String, nix::errno::Errno),
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

fn load_environment(path: &Path) -> Result<(), HelperError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| HelperError::EnvFile(path.to_path_buf(), e))?;
    for (key, _) in std::env::vars() {
        std::env::remove_var(key);
    }
    for line in content.lines() {
        if let Some((key, val)) = line.split_once('=') {
            if is_valid_env_name(key) {
                std::env::set_var(key, val);
            }
        }
    }
    Ok(())
}

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

/// Reads the `outside` uid from `/proc/self/uid_map`'s single mapping
/// entry, falling back to the effective uid if it can't be parsed (e.g.
/// not actually running inside a remapped user namespace).
fn mapped_uid(euid: u32) -> u32 {
    std::fs::read_to_string("/proc/self/uid_map")
        .ok()
        .and_then(|content| {
            let fields: Vec<&str> = content.split_whitespace().collect();
            fields.get(1)?.parse().ok()
        })
        .unwrap_or(euid)
}

fn current_tty() -> String {
    unsafe {
        let ptr = libc::ttyname(0);
        if ptr.is_null() {
            return String::new();
        }
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

fn run_login_and_exec(command: &[String]) -> Result<(), HelperError> {
    let login_defs = ParamMap::load_file(Path::new(login::DEFAULT_LOGIN_DEFS)).unwrap_or_else(
        |err| {
            tracing::warn!(%err, "failed to read login.defs, continuing with defaults");
            ParamMap::empty()
        },
    );
    let locale_conf = ParamMap::load_file(Path::new(login::DEFAULT_LOCALE_CONF)).ok();
    let euid = nix::unistd::geteuid().as_raw();
    let mapped = mapped_uid(euid);
    let existing_env: HashMap<String, String> = std::env::vars().collect();
    let nologins_file = PathBuf::from(login_defs.get_or("NOLOGINS_FILE", login::DEFAULT_NOLOGINS_FILE));

    let syscall = create_syscall();
    let env = login::run_login(
        syscall.as_ref(),
        &login_defs,
        locale_conf.as_ref(),
        euid,
        mapped,
        &existing_env,
        &nologins_file,
    );

    for warning in &env.warnings {
        tracing::warn!(%warning, "login setup warning");
    }

    if let Some(nologin) = &env.nologin {
        if let Ok(contents) = std::fs::read_to_string(nologin) {
            print!("{contents}");
        }
        return Ok(());
    }

    for (key, val) in &env.vars {
        std::env::set_var(key, val);
    }
    if let Some(mask) = env.umask {
        umask(Mode::from_bits_truncate(mask));
    }
    if let Some(fsize) = env.rlimit_fsize {
        let _ = setrlimit(Resource::RLIMIT_FSIZE, fsize, fsize);
    }

    login::record_session(
        existing_env.get("USER").map(String::as_str).unwrap_or("root"),
        &current_tty(),
        nix::unistd::getpid().as_raw(),
    );
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let lastlog = Path::new(login::DEFAULT_LASTLOG);
    if let Err(err) = login::record_lastlog(lastlog, mapped, &current_tty(), now) {
        tracing::warn!(%err, "failed to record lastlog entry");
    }

    if let Some(home) = &env.home {
        if let Err(err) = nix::unistd::chdir(home.as_str()) {
            if env.home_required {
                return Err(HelperError::Chdir(home.clone(), err));
            }
            tracing::warn!(%err, home, "failed to chdir into $HOME, continuing in place");
        }
    }

    let shell_env = env
        .vars
        .iter()
        .find(|(k, _)| k == "SHELL")
        .map(|(_, v)| v.as_str())
        .or_else(|| existing_env.get("SHELL").map(String::as_str));
    let shell = login::choose_shell(&login_defs, shell_env);

    if command.is_empty() {
        if let Some(home) = &env.home {
            if let Some(text) = login::motd_text(&login_defs, Path::new(home)) {
                print!("{text}");
            }
        }
    }

    let argv = login::build_shell_argv(&shell, true, command, Path::new("/etc/rc"));
    exec_argv(&argv)
}

/// Non-`--login` counterpart to [`run_login_and_exec`]: same shell-selection
/// and command-dispatch policy (`FAKE_SHELL`/`$SHELL`/`/bin/sh`, `/etc/rc`,
/// spaced-command and non-executable heuristics), just without the login
/// procedure (no PAM-style session setup, no lastlog/utmp, no `-` argv0
/// prefix).
fn run_command_and_exec(command: &[String]) -> Result<(), HelperError> {
    let shell_env = std::env::var("SHELL").ok();
    let shell = login::choose_shell(&ParamMap::empty(), shell_env.as_deref());
    let argv = login::build_shell_argv(&shell, false, command, Path::new("/etc/rc"));
    exec_argv(&argv)
}

fn exec_argv(argv: &[String]) -> Result<(), HelperError> {
    let cstrs: Vec<CString> = argv
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<_, _>>()?;
    let program = cstrs[0].clone();
    // argv[0] may carry a `-` login marker that isn't the real executable
    // path; exec the real shell binary but hand over the synthesized argv.
    let exe = program.to_string_lossy().trim_start_matches('-').to_string();
    let exe_c = CString::new(exe.clone())?;
    let err = nix::unistd::execv(&exe_c, &cstrs).unwrap_err();
    Err(HelperError::Exec(exe, err))
}

fn run(opts: &Opts) -> Result<(), HelperError> {
    if let Some(envfile) = &opts.env {
        load_environment(envfile)?;
    }

    let last_cap = capability::read_cap_last_cap().map_err(HelperError::CapLastCap)?;

    let syscall = create_syscall();
    syscall
        .switch_root(&opts.rootfs)
        .map_err(|e| HelperError::SwitchRoot(opts.rootfs.clone(), e))?;
    syscall.chroot(Path::new(".")).map_err(HelperError::Chroot)?;
    if let Err(err) = syscall.unshare(CloneFlags::CLONE_NEWCGROUP) {
        if !matches!(err, SyscallError::UnshareFailed(nix::errno::Errno::EINVAL)) {
            return Err(HelperError::Chroot(err));
        }
    }

    capability::drop_privileges(syscall.as_ref(), last_cap).map_err(HelperError::DropPrivileges)?;

    close_fds_above_stderr();

    if opts.login {
        run_login_and_exec(&opts.command)
    } else {
        run_command_and_exec(&opts.command)
    }
}

fn main() {
    let opts = Opts::parse();
    init_tracing(opts.verbose);

    if let Err(err) = run(&opts) {
        eprintln!("{HELPER}: {err}");
        std::process::exit(1);
    }
}
