//! Rewrites an AUFS-style whiteout layer tree into an overlayfs-style one:
//! `.wh.foo` regular-file markers become overlayfs' character-device
//! whiteouts, and the `.wh..wh..opq` opaque-directory marker becomes the
//! `trusted.overlay.opaque` xattr on the directory itself.
use std::path::{Path, PathBuf};

use nix::sys::stat::{Mode, SFlag};
use walkdir::WalkDir;

use crate::syscall::{Syscall, SyscallError};

const WH_PREFIX: &str = ".wh.";
const WH_OPQ: &str = ".wh..wh..opq";

#[derive(Debug, thiserror::Error)]
pub enum WhiteoutError {
    #[error("unsupported aufs whiteout: {0:?}")]
    Unsupported(PathBuf),
    #[error("failed to walk {path:?}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

type Result<T> = std::result::Result<T, WhiteoutError>;

/// Walks `dir` depth-first, post-order (children before the directory that
/// contains them, mirroring `nftw`'s `FTW_DEPTH`), translating every AUFS
/// whiteout marker it finds. Does not cross mount points, matching the
/// reference implementation's `FTW_MOUNT`.
pub fn translate(syscall: &dyn Syscall, dir: &Path) -> Result<()> {
    let root_dev = std::fs::symlink_metadata(dir)
        .ok()
        .map(|m| std::os::unix::fs::MetadataExt::dev(&m));

    let walker = WalkDir::new(dir).contents_first(true).into_iter();
    for entry in walker {
        let entry = entry.map_err(|source| WhiteoutError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if let (Some(root_dev), Ok(meta)) = (root_dev, entry.metadata()) {
            if std::os::unix::fs::MetadataExt::dev(&meta) != root_dev {
                continue;
            }
        }

        let name = entry.file_name().to_string_lossy();
        let path = entry.path();

        if name == WH_OPQ {
            syscall.unlink(path)?;
            let parent = path.parent().unwrap_or(dir);
            syscall.setxattr(parent, "trusted.overlay.opaque", b"y")?;
            continue;
        }

        if let Some(rest) = name.strip_prefix(WH_PREFIX) {
            if rest.starts_with(".wh.") {
                return Err(WhiteoutError::Unsupported(path.to_path_buf()));
            }
            syscall.unlink(path)?;
            let target = path.with_file_name(rest);
            syscall.mknod(&target, SFlag::S_IFCHR, Mode::from_bits_truncate(0o600), 0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_plain_whiteout_becomes_char_device() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".wh.foo"), b"").unwrap();
        let syscall = TestHelperSyscall::default();
        translate(&syscall, dir.path()).unwrap();

        let unlinks = syscall.get_unlink_args();
        assert_eq!(unlinks, vec![dir.path().join(".wh.foo")]);
        let mknods = syscall.get_mknod_args();
        assert_eq!(mknods.len(), 1);
        assert_eq!(mknods[0].path, dir.path().join("foo"));
        assert_eq!(mknods[0].kind, SFlag::S_IFCHR);
        assert_eq!(mknods[0].dev, 0);
    }

    #[test]
    fn test_opaque_marker_becomes_xattr() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/.wh..wh..opq"), b"").unwrap();
        let syscall = TestHelperSyscall::default();
        translate(&syscall, dir.path()).unwrap();

        assert_eq!(
            syscall.get_unlink_args(),
            vec![dir.path().join("sub/.wh..wh..opq")]
        );
        let attrs = syscall.get_setxattr_args();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].path, dir.path().join("sub"));
        assert_eq!(attrs[0].name, "trusted.overlay.opaque");
        assert_eq!(attrs[0].value, b"y");
    }

    #[test]
    fn test_double_prefix_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".wh..wh.foo"), b"").unwrap();
        let syscall = TestHelperSyscall::default();
        assert!(translate(&syscall, dir.path()).is_err());
    }
}
