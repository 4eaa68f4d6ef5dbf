//! Realizes a parsed fstab entry against a target root: creates the mount
//! point if asked to, performs the primary mount, remounts to apply
//! flags a bind mount can't take in one step, and finally sets any
//! requested propagation type.
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use crate::fstab::{CreateKind, MountEntry, PROPAGATION_FLAGS};
use crate::path::{self, PathError};
use crate::syscall::{Syscall, SyscallError};

#[derive(Debug, thiserror::Error)]
pub enum MountEngineError {
    #[error("failed to resolve target path: {0}")]
    Path(#[from] PathError),
    #[error("failed to create {path:?}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

type Result<T> = std::result::Result<T, MountEngineError>;

fn create_target(target: &Path, kind: CreateKind, source: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| MountEngineError::Create {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let want_dir = match kind {
        CreateKind::Dir => true,
        CreateKind::File => false,
        CreateKind::Auto => fs::metadata(source).map(|m| m.is_dir()).unwrap_or(true),
    };

    let result = if want_dir {
        fs::create_dir(target)
    } else {
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .open(target)
            .map(|_| ())
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(MountEngineError::Create {
            path: target.to_path_buf(),
            source,
        }),
    }
}

/// Mounts `entry.source` onto `entry.target` (or unmounts it, for
/// `x-detach`), applying the remount-for-flags and propagation dance the
/// reference mount helper performs.
pub fn mount_entry(syscall: &dyn Syscall, root: &Path, entry: &MountEntry) -> Result<()> {
    let target = path::realpath_at(root, Path::new(&entry.target))?;

    if entry.detach {
        return syscall
            .umount2(&target, MntFlags::MNT_DETACH)
            .map_err(MountEngineError::from);
    }

    if let Some(kind) = entry.create {
        create_target(&target, kind, &entry.source)?;
    }

    let propagation = entry.flags & PROPAGATION_FLAGS;
    let base_flags = entry.flags & !PROPAGATION_FLAGS;

    // Mirrors the reference `flags == 0 || flags & ~(PROPAGATION|REC|SILENT)`
    // check on the *un-split* flags: a pure propagation change (e.g. just
    // `shared`) skips the generic mount call entirely and only runs
    // `mount_propagate`, while an entry with no options at all (flags == 0,
    // e.g. a bare `tmpfs /dst`) still needs the one mount call to happen.
    let runs_generic = entry.flags.is_empty()
        || !(entry.flags & !(PROPAGATION_FLAGS | MsFlags::MS_REC | MsFlags::MS_SILENT)).is_empty();

    if runs_generic {
        mount_generic(syscall, &target, entry, base_flags)?;
    }

    if !propagation.is_empty() {
        mount_propagate(syscall, &target, entry, propagation)?;
    }

    Ok(())
}

/// Returns whether the calling process is confined to a user namespace
/// with the fixed `0 <id> 1` single-entry mapping this workspace's own
/// `unshare`/`nsenter` helpers write (spec §4.4 step 3's `detect_userns`).
///
/// Reading `/proc/self/{u,g}id_map`/`setgroups` is plain file I/O, not a
/// capability-bracketed operation, so this doesn't go through [`Syscall`].
pub fn detect_userns() -> bool {
    fn is_identity_map(path: &str) -> bool {
        std::fs::read_to_string(path)
            .map(|content| {
                content
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .as_slice()
                    == ["0", "0", &u32::MAX.to_string()]
            })
            .unwrap_or(false)
    }

    let setgroups_denied = std::fs::read_to_string("/proc/self/setgroups")
        .map(|c| c.trim() == "deny")
        .unwrap_or(false);

    setgroups_denied
        && is_identity_map("/proc/self/uid_map")
        && is_identity_map("/proc/self/gid_map")
}

const BIND_FOLD_FLAGS: MsFlags = nix_flags_union(
    nix_flags_union(MsFlags::MS_NOSUID, MsFlags::MS_NODEV),
    nix_flags_union(
        nix_flags_union(MsFlags::MS_NOEXEC, MsFlags::MS_RDONLY),
        nix_flags_union(
            nix_flags_union(MsFlags::MS_NOATIME, MsFlags::MS_NODIRATIME),
            nix_flags_union(MsFlags::MS_RELATIME, MsFlags::MS_STRICTATIME),
        ),
    ),
);

const fn nix_flags_union(a: MsFlags, b: MsFlags) -> MsFlags {
    MsFlags::from_bits_truncate(a.bits() | b.bits())
}

fn mount_generic(
    syscall: &dyn Syscall,
    target: &Path,
    entry: &MountEntry,
    mut flags: MsFlags,
) -> Result<()> {
    if !entry.rbind {
        flags.remove(MsFlags::MS_REC);
    }

    // The kernel silently refuses to drop these flags across a bind mount
    // performed from inside a user namespace; fold in whatever the source
    // (or, for a remount, the already-mounted target) already carries so
    // the mount doesn't get rejected.
    if (flags.contains(MsFlags::MS_BIND) || flags.contains(MsFlags::MS_REMOUNT))
        && detect_userns()
    {
        let probe = if flags.contains(MsFlags::MS_REMOUNT) {
            target
        } else {
            Path::new(&entry.source)
        };
        if let Ok(source_flags) = syscall.statvfs_flags(probe) {
            flags |= source_flags & BIND_FOLD_FLAGS;
        }
    }

    let data = (!entry.data.is_empty()).then_some(entry.data.as_str());
    let source = (!entry.source.is_empty()).then_some(Path::new(&entry.source));
    syscall.mount(source, target, Some(&entry.fstype), flags, data)?;

    if flags.contains(MsFlags::MS_BIND) && !flags.contains(MsFlags::MS_REMOUNT) {
        let only_bind_rec = (flags & !(MsFlags::MS_BIND | MsFlags::MS_REC)).is_empty();
        if only_bind_rec && entry.data.is_empty() {
            return Ok(());
        }
        syscall.mount(None, target, None, flags | MsFlags::MS_REMOUNT, data)?;
    }
    Ok(())
}

fn mount_propagate(
    syscall: &dyn Syscall,
    target: &Path,
    entry: &MountEntry,
    flags: MsFlags,
) -> Result<()> {
    const PROPAGATIONS: &[MsFlags] = &[
        MsFlags::MS_SHARED,
        MsFlags::MS_SLAVE,
        MsFlags::MS_PRIVATE,
        MsFlags::MS_UNBINDABLE,
    ];

    for &bit in PROPAGATIONS {
        if !flags.contains(bit) {
            continue;
        }
        let mut tmp = bit | (flags & MsFlags::MS_SILENT);
        // Each propagation type's recursiveness is whatever its own
        // literal `r`-prefixed token asked for (`rshared` vs `shared`),
        // not a single entry-wide flag: `shared,rslave` must only apply
        // `MS_REC` to the `slave` mount call.
        if entry.rec_propagation.contains(bit) {
            tmp |= MsFlags::MS_REC;
        }
        syscall.mount(None, target, None, tmp, None)?;
    }
    Ok(())
}

/// Creates/mounts/propagates every entry of a parsed fstab, in order.
/// A non-fatal entry's error is logged and skipped; a fatal one (the
/// default, absent `nofail`) aborts the whole batch.
pub fn mount_fstab(syscall: &dyn Syscall, root: &Path, entries: &[MountEntry]) -> Result<()> {
    for entry in entries {
        match mount_entry(syscall, root, entry) {
            Ok(()) => {}
            Err(err) if entry.nofail => {
                if !entry.silent {
                    tracing::warn!(target = %entry.target, %err, "mount entry failed, continuing (nofail)");
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fstab::parse_fstab;
    use crate::syscall::test::TestHelperSyscall;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_mount_entry_bind() {
        let root = tempdir().unwrap();
        let src = tempdir().unwrap();
        let entries = parse_fstab(
            Cursor::new(format!("{} /dst none rbind\n", src.path().display())),
            None,
        )
        .unwrap();
        let syscall = TestHelperSyscall::default();
        mount_entry(&syscall, root.path(), &entries[0]).unwrap();
        let calls = syscall.get_mount_args();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC));
    }

    #[test]
    fn test_mount_entry_detach() {
        let root = tempdir().unwrap();
        let entries = parse_fstab(Cursor::new("/src /dst none x-detach\n"), None).unwrap();
        let syscall = TestHelperSyscall::default();
        mount_entry(&syscall, root.path(), &entries[0]).unwrap();
        assert_eq!(syscall.get_umount2_args().len(), 1);
        assert!(syscall.get_mount_args().is_empty());
    }

    #[test]
    fn test_create_target_dir() {
        let root = tempdir().unwrap();
        let target = root.path().join("a/b");
        create_target(&target, CreateKind::Dir, "").unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_create_target_file() {
        let root = tempdir().unwrap();
        let target = root.path().join("a/b");
        create_target(&target, CreateKind::File, "").unwrap();
        assert!(target.is_file());
    }

    #[test]
    fn test_detect_userns_reads_proc_self() {
        // Whatever namespace this test happens to run in, the detector
        // must not panic and must agree with itself on repeated reads.
        assert_eq!(detect_userns(), detect_userns());
    }

    #[test]
    fn test_pure_propagation_entry_skips_generic_mount() {
        // A line that only asks for a propagation change on an already
        // mounted target must not issue a primary `mount()` call at all,
        // only the propagation one - issuing a bogus plain mount alongside
        // it would fail against a real kernel.
        let root = tempdir().unwrap();
        let entries = parse_fstab(Cursor::new("none /dst none shared\n"), None).unwrap();
        let syscall = TestHelperSyscall::default();
        mount_entry(&syscall, root.path(), &entries[0]).unwrap();
        assert!(syscall.get_mount_args().is_empty());
    }

    #[test]
    fn test_empty_options_entry_still_mounts() {
        // A bare `tmpfs /dst` carries no options at all (flags == 0); the
        // primary mount call still has to happen even though base_flags is
        // also empty in this case.
        let root = tempdir().unwrap();
        let entries = parse_fstab(Cursor::new("tmpfs /dst\n"), None).unwrap();
        let syscall = TestHelperSyscall::default();
        mount_entry(&syscall, root.path(), &entries[0]).unwrap();
        assert_eq!(syscall.get_mount_args().len(), 1);
    }
}
