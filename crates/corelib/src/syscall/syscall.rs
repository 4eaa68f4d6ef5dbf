//! Interface trait so the rest of this workspace can call the kernel
//! without every module having to worry about `unsafe` or mocking details.
use std::any::Any;
use std::ffi::OsStr;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use caps::{CapSet, CapsHashSet};
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use crate::syscall::linux::LinuxSyscall;
use crate::syscall::test::TestHelperSyscall;
use crate::syscall::Result;

/// Everything the helper binaries need from the kernel, behind one seam so
/// it can be swapped for [`TestHelperSyscall`] under test.
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;

    fn unshare(&self, flags: CloneFlags) -> Result<()>;
    fn set_ns(&self, rawfd: RawFd, nstype: CloneFlags) -> Result<()>;

    /// Sets the real/effective/saved uid and gid, bracketed by
    /// `PR_SET_KEEPCAPS` so the capability set survives the uid change.
    fn set_real_ids(&self, uid: Uid, gid: Gid) -> Result<()>;
    fn set_groups(&self, groups: &[Gid]) -> Result<()>;
    fn set_keep_capabilities(&self, keep: bool) -> Result<()>;
    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<()>;

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()>;
    /// Returns the `MsFlags` bits (`MS_RDONLY`, `MS_NOSUID`, ...) currently
    /// set on the filesystem backing `path`, for bind-mount flag folding.
    fn statvfs_flags(&self, path: &Path) -> Result<MsFlags>;

    /// Performs the full pivot_root dance into `new_root` and detaches the
    /// old root, leaving the caller chdir'd into the new root.
    fn switch_root(&self, new_root: &Path) -> Result<()>;
    fn chroot(&self, path: &Path) -> Result<()>;

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()>;
    fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()>;
    fn unlink(&self, path: &Path) -> Result<()>;

    fn get_pwuid(&self, uid: u32) -> Option<Arc<OsStr>>;
    fn get_pwdir(&self, uid: u32) -> Option<String>;

    /// Full passwd-database lookup, used by the login procedure to pick a
    /// shell and populate `HOME`/`USER`/`LOGNAME`.
    fn get_passwd(&self, uid: u32) -> Option<PasswdEntry>;
    /// Primary-group name lookup, used for the login procedure's
    /// user-private-groups `umask` quirk.
    fn get_group_name(&self, gid: u32) -> Option<String>;
}

/// The fields of a passwd-database entry the login procedure needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub dir: String,
    pub shell: String,
}

#[derive(Clone, Copy)]
pub enum SyscallType {
    Linux,
    Test,
}

impl Default for SyscallType {
    fn default() -> Self {
        if cfg!(test) {
            SyscallType::Test
        } else {
            SyscallType::Linux
        }
    }
}

impl SyscallType {
    pub fn create_syscall(&self) -> Box<dyn Syscall> {
        match self {
            SyscallType::Linux => Box::new(LinuxSyscall),
            SyscallType::Test => Box::<TestHelperSyscall>::default(),
        }
    }
}

pub fn create_syscall() -> Box<dyn Syscall> {
    SyscallType::default().create_syscall()
}
