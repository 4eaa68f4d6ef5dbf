//! A mock [`Syscall`] impl that records calls instead of touching the
//! kernel, so namespace/mount/whiteout logic can be unit tested without
//! root.
use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use caps::{CapSet, CapsHashSet};
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use super::{PasswdEntry, Result, Syscall};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Umount2Args {
    pub target: PathBuf,
    pub flags: MntFlags,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MknodArgs {
    pub path: PathBuf,
    pub kind: SFlag,
    pub perm: Mode,
    pub dev: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SetxattrArgs {
    pub path: PathBuf,
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Default)]
struct Mock {
    values: Vec<Box<dyn Any>>,
    ret_err: Option<fn() -> Result<()>>,
    ret_err_times: usize,
}

#[derive(PartialEq, Eq, Hash, Copy, Clone)]
pub enum ArgName {
    Namespace,
    Unshare,
    RealIds,
    Groups,
    KeepCapabilities,
    Capability,
    Mount,
    Umount2,
    SwitchRoot,
    Chroot,
    Mknod,
    Setxattr,
    Unlink,
}

impl ArgName {
    fn iterator() -> impl Iterator<Item = ArgName> {
        [
            ArgName::Namespace,
            ArgName::Unshare,
            ArgName::RealIds,
            ArgName::Groups,
            ArgName::KeepCapabilities,
            ArgName::Capability,
            ArgName::Mount,
            ArgName::Umount2,
            ArgName::SwitchRoot,
            ArgName::Chroot,
            ArgName::Mknod,
            ArgName::Setxattr,
            ArgName::Unlink,
        ]
        .iter()
        .copied()
    }
}

struct MockCalls {
    args: HashMap<ArgName, RefCell<Mock>>,
}

impl Default for MockCalls {
    fn default() -> Self {
        let mut m = MockCalls {
            args: HashMap::new(),
        };
        for name in ArgName::iterator() {
            m.args.insert(name, RefCell::new(Mock::default()));
        }
        m
    }
}

impl MockCalls {
    fn act(&self, name: ArgName, value: Box<dyn Any>) -> Result<()> {
        if self.args.get(&name).unwrap().borrow().ret_err_times > 0 {
            self.args.get(&name).unwrap().borrow_mut().ret_err_times -= 1;
            if let Some(e) = &self.args.get(&name).unwrap().borrow().ret_err {
                return e();
            }
        }

        self.args
            .get(&name)
            .unwrap()
            .borrow_mut()
            .values
            .push(value);
        Ok(())
    }

    fn fetch(&self, name: ArgName) -> Ref<Mock> {
        self.args.get(&name).unwrap().borrow()
    }

    fn fetch_mut(&self, name: ArgName) -> RefMut<Mock> {
        self.args.get(&name).unwrap().borrow_mut()
    }
}

#[derive(Default)]
pub struct TestHelperSyscall {
    mocks: MockCalls,
}

impl Syscall for TestHelperSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        self.mocks.act(ArgName::Unshare, Box::new(flags))
    }

    fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()> {
        self.mocks
            .act(ArgName::Namespace, Box::new((rawfd, nstype)))
    }

    fn set_real_ids(&self, uid: Uid, gid: Gid) -> Result<()> {
        self.mocks.act(ArgName::RealIds, Box::new((uid, gid)))
    }

    fn set_groups(&self, groups: &[Gid]) -> Result<()> {
        self.mocks.act(ArgName::Groups, Box::new(groups.to_vec()))
    }

    fn set_keep_capabilities(&self, keep: bool) -> Result<()> {
        self.mocks.act(ArgName::KeepCapabilities, Box::new(keep))
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<()> {
        self.mocks
            .act(ArgName::Capability, Box::new((cset, value.clone())))
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        self.mocks.act(
            ArgName::Mount,
            Box::new(MountArgs {
                source: source.map(Path::to_path_buf),
                target: target.to_path_buf(),
                fstype: fstype.map(str::to_owned),
                flags,
                data: data.map(str::to_owned),
            }),
        )
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        self.mocks.act(
            ArgName::Umount2,
            Box::new(Umount2Args {
                target: target.to_path_buf(),
                flags,
            }),
        )
    }

    fn statvfs_flags(&self, _path: &Path) -> Result<MsFlags> {
        Ok(MsFlags::empty())
    }

    fn switch_root(&self, new_root: &Path) -> Result<()> {
        self.mocks
            .act(ArgName::SwitchRoot, Box::new(new_root.to_path_buf()))
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        self.mocks
            .act(ArgName::Chroot, Box::new(path.to_path_buf()))
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()> {
        self.mocks.act(
            ArgName::Mknod,
            Box::new(MknodArgs {
                path: path.to_path_buf(),
                kind,
                perm,
                dev,
            }),
        )
    }

    fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        self.mocks.act(
            ArgName::Setxattr,
            Box::new(SetxattrArgs {
                path: path.to_path_buf(),
                name: name.to_owned(),
                value: value.to_vec(),
            }),
        )
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        self.mocks
            .act(ArgName::Unlink, Box::new(path.to_path_buf()))
    }

    fn get_pwuid(&self, _uid: u32) -> Option<Arc<OsStr>> {
        Some(OsString::from("nobody").into())
    }

    fn get_pwdir(&self, _uid: u32) -> Option<String> {
        Some("/home/nobody".to_owned())
    }

    fn get_passwd(&self, uid: u32) -> Option<PasswdEntry> {
        Some(PasswdEntry {
            name: "nobody".to_owned(),
            uid,
            gid: uid,
            dir: "/home/nobody".to_owned(),
            shell: "/bin/sh".to_owned(),
        })
    }

    fn get_group_name(&self, _gid: u32) -> Option<String> {
        Some("nobody".to_owned())
    }
}

impl TestHelperSyscall {
    pub fn set_ret_err(&self, name: ArgName, err: fn() -> Result<()>) {
        self.mocks.fetch_mut(name).ret_err = Some(err);
        self.set_ret_err_times(name, 1);
    }

    pub fn set_ret_err_times(&self, name: ArgName, times: usize) {
        self.mocks.fetch_mut(name).ret_err_times = times;
    }

    pub fn get_unshare_args(&self) -> Vec<CloneFlags> {
        self.mocks
            .fetch(ArgName::Unshare)
            .values
            .iter()
            .map(|x| *x.downcast_ref::<CloneFlags>().unwrap())
            .collect()
    }

    pub fn get_setns_args(&self) -> Vec<(i32, CloneFlags)> {
        self.mocks
            .fetch(ArgName::Namespace)
            .values
            .iter()
            .map(|x| *x.downcast_ref::<(i32, CloneFlags)>().unwrap())
            .collect()
    }

    pub fn get_set_capability_args(&self) -> Vec<(CapSet, CapsHashSet)> {
        self.mocks
            .fetch(ArgName::Capability)
            .values
            .iter()
            .map(|x| x.downcast_ref::<(CapSet, CapsHashSet)>().unwrap().clone())
            .collect()
    }

    pub fn get_groups_args(&self) -> Vec<Vec<Gid>> {
        self.mocks
            .fetch(ArgName::Groups)
            .values
            .iter()
            .map(|x| x.downcast_ref::<Vec<Gid>>().unwrap().clone())
            .collect()
    }

    pub fn get_mount_args(&self) -> Vec<MountArgs> {
        self.mocks
            .fetch(ArgName::Mount)
            .values
            .iter()
            .map(|x| x.downcast_ref::<MountArgs>().unwrap().clone())
            .collect()
    }

    pub fn get_umount2_args(&self) -> Vec<Umount2Args> {
        self.mocks
            .fetch(ArgName::Umount2)
            .values
            .iter()
            .map(|x| x.downcast_ref::<Umount2Args>().unwrap().clone())
            .collect()
    }

    pub fn get_switch_root_args(&self) -> Vec<PathBuf> {
        self.mocks
            .fetch(ArgName::SwitchRoot)
            .values
            .iter()
            .map(|x| x.downcast_ref::<PathBuf>().unwrap().clone())
            .collect()
    }

    pub fn get_mknod_args(&self) -> Vec<MknodArgs> {
        self.mocks
            .fetch(ArgName::Mknod)
            .values
            .iter()
            .map(|x| x.downcast_ref::<MknodArgs>().unwrap().clone())
            .collect()
    }

    pub fn get_setxattr_args(&self) -> Vec<SetxattrArgs> {
        self.mocks
            .fetch(ArgName::Setxattr)
            .values
            .iter()
            .map(|x| x.downcast_ref::<SetxattrArgs>().unwrap().clone())
            .collect()
    }

    pub fn get_unlink_args(&self) -> Vec<PathBuf> {
        self.mocks
            .fetch(ArgName::Unlink)
            .values
            .iter()
            .map(|x| x.downcast_ref::<PathBuf>().unwrap().clone())
            .collect()
    }
}
