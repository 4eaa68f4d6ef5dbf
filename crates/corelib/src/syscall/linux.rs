//! Implements [`Syscall`] against the real kernel.
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::{any::Any, mem, ptr};

use caps::{CapSet, Capability, CapsHashSet};
use libc::uid_t;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::sys::statvfs::statvfs;
use nix::unistd::{self, chdir, fchdir, pivot_root, setgroups, Gid, Uid};

use super::{PasswdEntry, Syscall, SyscallError};
use crate::syscall::Result;

#[derive(Clone)]
pub struct LinuxSyscall;

impl LinuxSyscall {
    /// Reads the `c_passwd` entry into an owned name.
    unsafe fn passwd_name(passwd: &libc::passwd) -> Arc<OsStr> {
        Arc::from(OsStr::from_bytes(
            CStr::from_ptr(passwd.pw_name).to_bytes(),
        ))
    }

    unsafe fn getpwuid(uid: uid_t) -> Option<libc::passwd> {
        let mut passwd = mem::zeroed::<libc::passwd>();
        let mut buf = vec![0u8; 2048];
        let mut result = ptr::null_mut::<libc::passwd>();

        loop {
            let r =
                libc::getpwuid_r(uid, &mut passwd, buf.as_mut_ptr() as *mut _, buf.len(), &mut result);
            if r != libc::ERANGE {
                break;
            }
            buf.resize(buf.len().checked_mul(2)?, 0);
        }

        if result.is_null() {
            return None;
        }
        Some(passwd)
    }
}

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        unshare(flags).map_err(SyscallError::UnshareFailed)
    }

    fn set_ns(&self, rawfd: RawFd, nstype: CloneFlags) -> Result<()> {
        setns(rawfd, nstype).map_err(SyscallError::SetNamespaceFailed)
    }

    fn set_real_ids(&self, uid: Uid, gid: Gid) -> Result<()> {
        self.set_keep_capabilities(true)?;
        unistd::setresgid(gid, gid, gid).map_err(|errno| SyscallError::SetRealGidFailed {
            errno,
            gid,
        })?;
        unistd::setresuid(uid, uid, uid).map_err(|errno| SyscallError::SetRealUidFailed {
            errno,
            uid,
        })?;
        self.set_keep_capabilities(false)?;
        Ok(())
    }

    fn set_groups(&self, groups: &[Gid]) -> Result<()> {
        setgroups(groups).map_err(|errno| SyscallError::SetGroupsFailed {
            groups: groups.to_vec(),
            errno,
        })
    }

    fn set_keep_capabilities(&self, keep: bool) -> Result<()> {
        prctl::set_keep_capabilities(keep).map_err(|errno| {
            SyscallError::PrctlSetKeepCapabilitiesFailed {
                errno: Errno::from_i32(errno),
                value: keep,
            }
        })
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<()> {
        match cset {
            // caps::set cannot touch the bounding set; drop what isn't wanted instead.
            CapSet::Bounding => {
                for c in caps::all().difference(value) {
                    match c {
                        Capability::CAP_PERFMON
                        | Capability::CAP_CHECKPOINT_RESTORE
                        | Capability::CAP_BPF => {
                            tracing::warn!(capability = ?c, "not supported on this kernel, skipping");
                            continue;
                        }
                        _ => caps::drop(None, CapSet::Bounding, *c)?,
                    }
                }
            }
            _ => caps::set(None, cset, value)?,
        }
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).map_err(|errno| SyscallError::MountFailed {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_owned),
            flags,
            data: data.map(str::to_owned),
            errno,
        })
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags).map_err(|errno| SyscallError::UmountFailed {
            target: target.to_path_buf(),
            errno,
        })
    }

    fn statvfs_flags(&self, path: &Path) -> Result<MsFlags> {
        let st = statvfs(path).map_err(|errno| SyscallError::StatvfsFailed {
            path: path.to_path_buf(),
            errno,
        })?;
        let mut flags = MsFlags::empty();
        let f = st.flags();
        if f.contains(nix::sys::statvfs::FsFlags::ST_RDONLY) {
            flags |= MsFlags::MS_RDONLY;
        }
        if f.contains(nix::sys::statvfs::FsFlags::ST_NOSUID) {
            flags |= MsFlags::MS_NOSUID;
        }
        if f.contains(nix::sys::statvfs::FsFlags::ST_NODEV) {
            flags |= MsFlags::MS_NODEV;
        }
        if f.contains(nix::sys::statvfs::FsFlags::ST_NOEXEC) {
            flags |= MsFlags::MS_NOEXEC;
        }
        if f.contains(nix::sys::statvfs::FsFlags::ST_NOATIME) {
            flags |= MsFlags::MS_NOATIME;
        }
        if f.contains(nix::sys::statvfs::FsFlags::ST_NODIRATIME) {
            flags |= MsFlags::MS_NODIRATIME;
        }
        if f.contains(nix::sys::statvfs::FsFlags::ST_RELATIME) {
            flags |= MsFlags::MS_RELATIME;
        }
        Ok(flags)
    }

    /// Performs the pivot_root dance: open both roots as `O_PATH` dirs,
    /// pivot into the new one, detach the old one in the background, and
    /// leave the caller chdir'd into `/`.
    fn switch_root(&self, new_root: &Path) -> Result<()> {
        let newroot_fd = open(
            new_root,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY,
            Mode::empty(),
        )
        .map_err(|errno| SyscallError::SwitchRootFailed {
            path: new_root.to_path_buf(),
            msg: "open new root",
            errno,
        })?;
        let oldroot_fd = open("/", OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty()).map_err(
            |errno| SyscallError::SwitchRootFailed {
                path: "/".into(),
                msg: "open current root",
                errno,
            },
        )?;

        fchdir(newroot_fd).map_err(|errno| SyscallError::SwitchRootFailed {
            path: new_root.to_path_buf(),
            msg: "fchdir into new root",
            errno,
        })?;
        pivot_root(".", ".").map_err(|errno| SyscallError::SwitchRootFailed {
            path: new_root.to_path_buf(),
            msg: "pivot_root",
            errno,
        })?;

        fchdir(oldroot_fd).map_err(|errno| SyscallError::SwitchRootFailed {
            path: new_root.to_path_buf(),
            msg: "fchdir into old root",
            errno,
        })?;
        // Old root is now mounted on top of itself at cwd; keep its unmount
        // from propagating to the host mount namespace before detaching it.
        mount(
            None::<&str>,
            ".",
            None::<&str>,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|errno| SyscallError::SwitchRootFailed {
            path: new_root.to_path_buf(),
            msg: "mark old root rslave",
            errno,
        })?;
        umount2(".", MntFlags::MNT_DETACH).map_err(|errno| SyscallError::SwitchRootFailed {
            path: new_root.to_path_buf(),
            msg: "detach old root",
            errno,
        })?;

        fchdir(newroot_fd).map_err(|errno| SyscallError::SwitchRootFailed {
            path: new_root.to_path_buf(),
            msg: "fchdir back into new root",
            errno,
        })?;
        unistd::close(newroot_fd).ok();
        unistd::close(oldroot_fd).ok();
        chdir("/").map_err(|errno| SyscallError::SwitchRootFailed {
            path: new_root.to_path_buf(),
            msg: "chdir to /",
            errno,
        })
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        unistd::chroot(path).map_err(|errno| SyscallError::SwitchRootFailed {
            path: path.to_path_buf(),
            msg: "chroot",
            errno,
        })
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()> {
        mknod(path, kind, perm, dev).map_err(|errno| SyscallError::MknodFailed {
            path: path.to_path_buf(),
            errno,
        })
    }

    fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        xattr::set(path, name, value).map_err(|source| SyscallError::SetxattrFailed {
            path: path.to_path_buf(),
            name: name.to_owned(),
            source,
        })
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        unistd::unlink(path).map_err(|errno| SyscallError::UnlinkFailed {
            path: path.to_path_buf(),
            source: std::io::Error::from_raw_os_error(errno as i32),
        })
    }

    // Ported from the `users` crate's approach to `getpwuid_r`.
    fn get_pwuid(&self, uid: uid_t) -> Option<Arc<OsStr>> {
        let passwd = unsafe { Self::getpwuid(uid)? };
        Some(unsafe { Self::passwd_name(&passwd) })
    }

    fn get_pwdir(&self, uid: uid_t) -> Option<String> {
        let passwd = unsafe { Self::getpwuid(uid)? };
        let dir = unsafe { OsStr::from_bytes(CStr::from_ptr(passwd.pw_dir).to_bytes()) };
        dir.to_str().map(str::to_owned)
    }

    fn get_passwd(&self, uid: uid_t) -> Option<PasswdEntry> {
        let passwd = unsafe { Self::getpwuid(uid)? };
        let cstr = |p: *const libc::c_char| unsafe {
            OsStr::from_bytes(CStr::from_ptr(p).to_bytes())
                .to_str()
                .unwrap_or_default()
                .to_owned()
        };
        Some(PasswdEntry {
            name: cstr(passwd.pw_name),
            uid: passwd.pw_uid,
            gid: passwd.pw_gid,
            dir: cstr(passwd.pw_dir),
            shell: cstr(passwd.pw_shell),
        })
    }

    fn get_group_name(&self, gid: libc::gid_t) -> Option<String> {
        unsafe {
            let mut group = mem::zeroed::<libc::group>();
            let mut buf = vec![0u8; 2048];
            let mut result = ptr::null_mut::<libc::group>();
            loop {
                let r = libc::getgrgid_r(
                    gid,
                    &mut group,
                    buf.as_mut_ptr() as *mut _,
                    buf.len(),
                    &mut result,
                );
                if r != libc::ERANGE {
                    break;
                }
                buf.resize(buf.len().checked_mul(2)?, 0);
            }
            if result.is_null() {
                return None;
            }
            OsStr::from_bytes(CStr::from_ptr(group.gr_name).to_bytes())
                .to_str()
                .map(str::to_owned)
        }
    }
}
