//! Wraps the raw syscalls every other module needs behind a [`Syscall`]
//! trait, so mount/namespace/whiteout logic can be unit tested against a
//! mock instead of requiring root and real namespaces.

pub mod linux;
#[allow(clippy::module_inception)]
pub mod syscall;
pub mod test;

pub use syscall::{PasswdEntry, Syscall};

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error("failed to unshare: {0}")]
    UnshareFailed(nix::errno::Errno),
    #[error("failed to setns: {0}")]
    SetNamespaceFailed(nix::errno::Errno),
    #[error("failed to set real gid to {gid}: {errno}")]
    SetRealGidFailed {
        errno: nix::errno::Errno,
        gid: nix::unistd::Gid,
    },
    #[error("failed to set real uid to {uid}: {errno}")]
    SetRealUidFailed {
        errno: nix::errno::Errno,
        uid: nix::unistd::Uid,
    },
    #[error("set keep capabilities to {value} returned {errno}")]
    PrctlSetKeepCapabilitiesFailed {
        errno: nix::errno::Errno,
        value: bool,
    },
    #[error("failed to set capabilities: {0}")]
    SetCapsFailed(#[from] caps::errors::CapsError),
    #[error("setgroups failed: {errno}")]
    SetGroupsFailed {
        groups: Vec<nix::unistd::Gid>,
        errno: nix::errno::Errno,
    },
    #[error("mount failed: {target:?}: {errno}")]
    MountFailed {
        source: Option<std::path::PathBuf>,
        target: std::path::PathBuf,
        fstype: Option<String>,
        flags: nix::mount::MsFlags,
        data: Option<String>,
        errno: nix::errno::Errno,
    },
    #[error("umount2 failed: {target:?}: {errno}")]
    UmountFailed {
        target: std::path::PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("failed to switch root to {path:?}: {msg}: {errno}")]
    SwitchRootFailed {
        path: std::path::PathBuf,
        msg: &'static str,
        errno: nix::errno::Errno,
    },
    #[error("mknod failed: {path:?}: {errno}")]
    MknodFailed {
        path: std::path::PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("setxattr failed: {path:?} {name}: {source}")]
    SetxattrFailed {
        path: std::path::PathBuf,
        name: String,
        source: std::io::Error,
    },
    #[error("unlink failed: {path:?}: {source}")]
    UnlinkFailed {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("setrlimit failed: {errno}")]
    SetRlimitFailed { errno: nix::errno::Errno },
    #[error("statvfs failed: {path:?}: {errno}")]
    StatvfsFailed {
        path: std::path::PathBuf,
        errno: nix::errno::Errno,
    },
}

pub(crate) type Result<T> = std::result::Result<T, SyscallError>;
