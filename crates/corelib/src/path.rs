//! Chroot-safe path resolution: walks a path component by component under
//! a directory fd, so a malicious or merely unexpected symlink inside the
//! target root can never escape it, the way following `root/a/../../etc`
//! through a plain `Path::join` + `canonicalize` could.
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{readlinkat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;

/// Linux's `MAXSYMLINKS`.
const MAX_SYMLINKS: u32 = 40;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("too many levels of symbolic links while resolving {0:?}")]
    TooManyLinks(PathBuf),
    #[error("path escapes root while resolving {0:?}")]
    Escapes(PathBuf),
    #[error("failed to open {path:?}: {source}")]
    Open { path: PathBuf, source: Errno },
    #[error("failed to resolve {path:?}: {source}")]
    Resolve { path: PathBuf, source: Errno },
}

type Result<T> = std::result::Result<T, PathError>;

struct OwnedFd(RawFd);

impl Drop for OwnedFd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn open_dir(dir: &Path) -> Result<OwnedFd> {
    nix::fcntl::open(dir, OFlag::O_PATH | OFlag::O_DIRECTORY, Mode::empty())
        .map(OwnedFd)
        .map_err(|source| PathError::Open {
            path: dir.to_path_buf(),
            source,
        })
}

fn reopen(fd: &mut OwnedFd, component: &str, flags: OFlag) -> Result<()> {
    let new_fd = nix::fcntl::openat(fd.as_raw_fd(), component, flags, Mode::empty()).map_err(
        |source| PathError::Open {
            path: PathBuf::from(component),
            source,
        },
    )?;
    let _ = close(fd.0);
    fd.0 = new_fd;
    Ok(())
}

/// Resolves `path` (which may be relative, absolute, or contain `..` and
/// symlinks) against `root` without ever leaving it, returning the
/// resolved path joined onto `root`.
///
/// Mirrors the reference implementation's `realpathat`: each component is
/// inspected with `readlinkat` before being descended into, so a symlink
/// found partway through resolution is expanded relative to `root` rather
/// than the host's real root. Components under a path prefix that doesn't
/// exist yet are kept as literal text (`noent_depth`), so resolving a
/// not-yet-created mount target still produces a sensible path instead of
/// failing outright.
pub fn realpath_at(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut fd = open_dir(root)?;
    let mut resolved = String::new();
    let mut noent_depth: u32 = 0;
    let mut link_depth: u32 = 0;

    let mut pending: Vec<String> = path
        .to_string_lossy()
        .split('/')
        .map(str::to_owned)
        .collect();
    pending.reverse();

    while let Some(comp) = pending.pop() {
        if comp.is_empty() || comp == "." {
            continue;
        }
        if comp == ".." {
            match resolved.rfind('/') {
                Some(idx) => resolved.truncate(idx),
                None => return Err(PathError::Escapes(path.to_path_buf())),
            }
            if noent_depth > 0 {
                noent_depth -= 1;
            } else {
                reopen(&mut fd, "..", OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_DIRECTORY)?;
            }
            continue;
        }

        if noent_depth > 0 {
            noent_depth += 1;
            resolved.push('/');
            resolved.push_str(&comp);
            continue;
        }

        let mut buf = [0u8; libc::PATH_MAX as usize];
        match readlinkat(fd.as_raw_fd(), comp.as_str(), &mut buf) {
            Ok(link) => {
                let link = link.to_string_lossy().into_owned();
                if link_depth >= MAX_SYMLINKS {
                    return Err(PathError::TooManyLinks(path.to_path_buf()));
                }
                link_depth += 1;

                let rest: Vec<String> = link.split('/').map(str::to_owned).collect();
                if link.starts_with('/') {
                    let _ = close(fd.0);
                    fd = open_dir(root)?;
                    resolved.clear();
                }
                for c in rest.into_iter().rev() {
                    pending.push(c);
                }
            }
            Err(Errno::EINVAL) => {
                reopen(&mut fd, comp.as_str(), OFlag::O_PATH | OFlag::O_NOFOLLOW)?;
                resolved.push('/');
                resolved.push_str(&comp);
            }
            Err(Errno::ENOENT) => {
                noent_depth += 1;
                resolved.push('/');
                resolved.push_str(&comp);
            }
            Err(source) => {
                return Err(PathError::Resolve {
                    path: PathBuf::from(comp),
                    source,
                })
            }
        }
    }

    let mut out = root.to_path_buf();
    if !resolved.is_empty() {
        out.push(resolved.trim_start_matches('/'));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_plain_path() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("a/b")).unwrap();
        let resolved = realpath_at(root.path(), Path::new("a/b")).unwrap();
        assert_eq!(resolved, root.path().join("a/b"));
    }

    #[test]
    fn test_dotdot_cannot_escape_root() {
        let root = tempdir().unwrap();
        let err = realpath_at(root.path(), Path::new("../../etc/passwd"));
        assert!(err.is_err());
    }

    #[test]
    fn test_symlink_is_resolved_under_root() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("real")).unwrap();
        std::os::unix::fs::symlink("real", root.path().join("link")).unwrap();
        let resolved = realpath_at(root.path(), Path::new("link/file")).unwrap();
        assert_eq!(resolved, root.path().join("real/file"));
    }

    #[test]
    fn test_nonexistent_prefix_kept_literal() {
        let root = tempdir().unwrap();
        let resolved = realpath_at(root.path(), Path::new("does/not/exist")).unwrap();
        assert_eq!(resolved, root.path().join("does/not/exist"));
    }
}
