//! User and mount namespace setup shared by the `unshare` and `nsenter`
//! helpers: creating a fresh user namespace with a uid/gid mapping, raising
//! ambient capabilities into it, and joining an existing namespace by pid.
use std::fs;
use std::path::{Path, PathBuf};

use caps::{CapSet, Capability, CapsHashSet};
use nix::sched::CloneFlags;
use nix::unistd::{Pid, Uid};

use crate::syscall::{Syscall, SyscallError};

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("syscall failed: {0}")]
    Syscall(#[from] SyscallError),
    #[error("failed to write {path:?}: {source}")]
    WriteMapping {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unknown namespace kind for /proc/{pid}/ns/{name}")]
    UnknownKind { pid: Pid, name: &'static str },
    #[error("failed to open namespace file {path:?}: {source}")]
    OpenNsFile {
        path: PathBuf,
        source: nix::errno::Errno,
    },
    #[error("prctl(PR_SET_SPECULATION_CTRL) failed: {0}")]
    SpeculationCtrl(nix::errno::Errno),
}

type Result<T> = std::result::Result<T, NamespaceError>;

/// Which kernel namespace a helper binary's `--user`/`--mount` flag refers
/// to, mapped down to a `CLONE_NEW*` flag and a `/proc/<pid>/ns/<name>` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    User,
    Mount,
    Cgroup,
}

impl NamespaceKind {
    fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
            NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    fn proc_ns_name(self) -> &'static str {
        match self {
            NamespaceKind::User => "user",
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Cgroup => "cgroup",
        }
    }
}

/// Unshares a new user namespace and writes a single-entry uid/gid mapping
/// of `0 -> <calling euid/egid>`, or of `<remap_root> -> 0` when
/// `remap_root` is set (mapping root itself into the namespace, the way a
/// privileged caller preparing a container for someone else would).
///
/// Write order is load-bearing: the kernel refuses to write `gid_map`
/// unless `setgroups` has first been denied, and `uid_map` has to follow.
pub fn unshare_user_ns(syscall: &dyn Syscall, remap_root: Option<Uid>) -> Result<()> {
    let euid = nix::unistd::geteuid();
    let egid = nix::unistd::getegid();

    syscall.unshare(CloneFlags::CLONE_NEWUSER)?;

    let pid = nix::unistd::getpid();
    let (inside_uid, outside_uid) = match remap_root {
        Some(root) => (root.as_raw(), 0),
        None => (0, euid.as_raw()),
    };
    let (inside_gid, outside_gid) = match remap_root {
        Some(_) => (0, 0),
        None => (0, egid.as_raw()),
    };

    write_single_mapping(&proc_path(pid, "setgroups"), "deny")?;
    write_single_mapping(
        &proc_path(pid, "gid_map"),
        &format!("{inside_gid} {outside_gid} 1"),
    )?;
    write_single_mapping(
        &proc_path(pid, "uid_map"),
        &format!("{inside_uid} {outside_uid} 1"),
    )?;

    Ok(())
}

fn proc_path(pid: Pid, leaf: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/{leaf}"))
}

fn write_single_mapping(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|source| NamespaceError::WriteMapping {
        path: path.to_owned(),
        source,
    })
}

/// Unshares a new mount namespace.
pub fn unshare_mount_ns(syscall: &dyn Syscall) -> Result<()> {
    syscall
        .unshare(CloneFlags::CLONE_NEWNS)
        .map_err(NamespaceError::from)
}

/// Copies the given capabilities from the inheritable set into the ambient
/// set, so they survive an upcoming `execve` without needing file
/// capabilities on the target binary.
pub fn raise_ambient_capabilities(syscall: &dyn Syscall, caps: &[Capability]) -> Result<()> {
    let inheritable: CapsHashSet = caps.iter().copied().collect();
    syscall.set_capability(CapSet::Inheritable, &inheritable)?;
    syscall.set_capability(CapSet::Ambient, &inheritable)?;
    Ok(())
}

/// Disables the SSBD and IBPB/STIBP speculative-execution mitigations for
/// this process and its descendants, opt-in via `--allow-speculation`.
///
/// The two historical variants of this workspace's unsharing helper both
/// did this unconditionally behind a compile-time flag, trading Spectre
/// mitigation for throughput inside a container that's already sandboxed
/// by the user namespace. Only a mitigation that's currently prctl-enforced
/// (`PR_SPEC_DISABLE`/`PR_SPEC_DISABLE_NOEXEC`) gets flipped back to
/// `PR_SPEC_ENABLE`; one that's off, forced, or not applicable to this
/// CPU/kernel is left untouched. `EINVAL`/`ENODEV` from the GET call (the
/// kernel doesn't implement the control at all) are not errors.
pub fn disable_speculation_mitigations() -> Result<()> {
    for which in [libc::PR_SPEC_STORE_BYPASS, libc::PR_SPEC_INDIRECT_BRANCH] {
        let state = unsafe { libc::prctl(libc::PR_GET_SPECULATION_CTRL, which, 0, 0, 0) };
        if state < 0 {
            let errno = nix::errno::Errno::last();
            if !matches!(errno, nix::errno::Errno::EINVAL | nix::errno::Errno::ENODEV) {
                return Err(NamespaceError::SpeculationCtrl(errno));
            }
            continue;
        }

        let currently_disabled = state == libc::PR_SPEC_PRCTL | libc::PR_SPEC_DISABLE
            || state == libc::PR_SPEC_PRCTL | libc::PR_SPEC_DISABLE_NOEXEC;
        if !currently_disabled {
            continue;
        }

        let ret = unsafe {
            libc::prctl(
                libc::PR_SET_SPECULATION_CTRL,
                which,
                libc::PR_SPEC_ENABLE,
                0,
                0,
            )
        };
        if ret != 0 {
            return Err(NamespaceError::SpeculationCtrl(nix::errno::Errno::last()));
        }
    }
    Ok(())
}

/// Joins the namespace of `kind` belonging to `pid`. Tolerates an absent
/// cgroup namespace file: older kernels, or kernels built without
/// `CONFIG_CGROUPS`, simply don't expose `/proc/<pid>/ns/cgroup`.
pub fn join_namespace(syscall: &dyn Syscall, pid: Pid, kind: NamespaceKind) -> Result<()> {
    let path = proc_path(pid, &format!("ns/{}", kind.proc_ns_name()));
    let fd = match nix::fcntl::open(
        &path,
        nix::fcntl::OFlag::O_RDONLY,
        nix::sys::stat::Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(nix::errno::Errno::ENOENT) if kind == NamespaceKind::Cgroup => return Ok(()),
        Err(source) => return Err(NamespaceError::OpenNsFile { path, source }),
    };

    let result = syscall.set_ns(fd, kind.clone_flag());
    let _ = nix::unistd::close(fd);
    result.map_err(NamespaceError::from)
}
