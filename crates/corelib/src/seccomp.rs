//! The fixed seccomp filter installed by the `unshare`/`nsenter` helpers for
//! any `--user` invocation: instead of actually owning files, the uid/gid-
//! changing syscall family is turned into a silent no-op so that unpacking
//! an image as an unprivileged user doesn't fail on `chown`.
use std::collections::BTreeMap;

use seccompiler::{
    apply_filter, BackendError, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
    SeccompFilter, SeccompRule, TargetArch,
};

#[derive(Debug, thiserror::Error)]
pub enum SeccompError {
    #[error("unsupported architecture for seccomp filtering")]
    UnsupportedArch,
    #[error("failed to build seccomp filter: {0}")]
    Build(#[from] seccompiler::Error),
    #[error("failed to install seccomp filter: {0}")]
    Apply(#[from] BackendError),
    #[error("prctl(PR_SET_SECCOMP) fallback failed: {0}")]
    PrctlFallback(nix::errno::Errno),
}

/// Syscalls that always return success without doing anything.
const SPOOFED_ALWAYS: &[i64] = &[
    libc::SYS_chown,
    libc::SYS_lchown,
    libc::SYS_fchown,
    libc::SYS_fchownat,
    libc::SYS_setuid,
    libc::SYS_setgid,
    libc::SYS_setreuid,
    libc::SYS_setregid,
    libc::SYS_setresuid,
    libc::SYS_setresgid,
    libc::SYS_setgroups,
];

/// `setfsuid`/`setfsgid` double as a probe for the caller's own fsuid/fsgid
/// (the kernel returns the previous value, ignoring the argument, when it
/// isn't a valid id change). The real enroot does not spoof the probe form
/// (argument `-1`) since nothing would be able to distinguish a forged
/// return value from the real one.
const SPOOFED_PROBED: &[i64] = &[libc::SYS_setfsuid, libc::SYS_setfsgid];

fn target_arch() -> Result<TargetArch, SeccompError> {
    if cfg!(target_arch = "x86_64") {
        Ok(TargetArch::x86_64)
    } else if cfg!(target_arch = "aarch64") {
        Ok(TargetArch::aarch64)
    } else {
        Err(SeccompError::UnsupportedArch)
    }
}

/// Installs the classic-BPF filter that spoofs privileged ownership
/// syscalls into successful no-ops, for use by a process that has dropped
/// the real capabilities needed to perform them.
pub fn install_id_spoof_filter() -> Result<(), SeccompError> {
    let arch = target_arch()?;
    let mut rules = BTreeMap::new();

    for &nr in SPOOFED_ALWAYS {
        rules.insert(nr, vec![SeccompRule::new(vec![], SeccompAction::Errno(0))?]);
    }

    for &nr in SPOOFED_PROBED {
        rules.insert(
            nr,
            vec![
                // Probe form (arg0 == -1): let it through so the caller
                // observes its real fsuid/fsgid.
                SeccompRule::new(
                    vec![SeccompCondition::new(
                        0,
                        SeccompCmpArgLen::Dword,
                        SeccompCmpOp::Eq,
                        u32::MAX as u64,
                    )?],
                    SeccompAction::Allow,
                )?,
                // Any other argument is a real id change attempt: spoof it.
                SeccompRule::new(vec![], SeccompAction::Errno(0))?,
            ],
        );
    }

    let filter = SeccompFilter::new(rules, SeccompAction::Allow, SeccompAction::Allow, arch)?;
    let program: seccompiler::BpfProgram = filter.try_into()?;

    if let Err(err) = apply_filter(&program) {
        tracing::warn!(%err, "seccomp(2) install failed, falling back to prctl(PR_SET_SECCOMP)");
        install_via_prctl(&program)?;
        tracing::debug!("installed seccomp id-spoof filter via prctl fallback");
        return Ok(());
    }

    tracing::debug!("installed seccomp id-spoof filter");
    Ok(())
}

/// Installs a compiled BPF program via the older `prctl(PR_SET_SECCOMP)`
/// interface, for kernels built without the `seccomp(2)` syscall.
fn install_via_prctl(program: &seccompiler::BpfProgram) -> Result<(), SeccompError> {
    let prog = libc::sock_fprog {
        len: program.len() as u16,
        filter: program.as_ptr() as *mut libc::sock_filter,
    };
    let ret = unsafe { libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_FILTER, &prog) };
    if ret != 0 {
        return Err(SeccompError::PrctlFallback(nix::errno::Errno::last()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use common::test_utils::test_in_child_process;
    use serial_test::serial;

    #[test]
    fn test_target_arch_matches_compiled_platform() {
        let result = target_arch();
        if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(SeccompError::UnsupportedArch)));
        }
    }

    // Installs the real filter in a forked child (never in the test
    // process itself, since the filter is irreversible for its caller)
    // and checks that a spoofed syscall returns success where it would
    // otherwise fail with EPERM for an unprivileged process.
    #[test]
    #[serial]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_install_id_spoof_filter_spoofs_setuid() -> anyhow::Result<()> {
        test_in_child_process(|| {
            install_id_spoof_filter().map_err(|err| anyhow::anyhow!(err))?;

            let ret = unsafe { libc::setuid(12_345) };
            if ret != 0 {
                bail!("setuid wasn't spoofed by the installed filter: returned {ret}");
            }
            Ok(())
        })
    }

    #[test]
    #[serial]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_install_id_spoof_filter_lets_fsuid_probe_through() -> anyhow::Result<()> {
        test_in_child_process(|| {
            install_id_spoof_filter().map_err(|err| anyhow::anyhow!(err))?;

            // The probe form (arg0 == -1) is explicitly let through rather
            // than spoofed, so it must still report the caller's real fsuid.
            let real = unsafe { libc::setfsuid(-1i32 as libc::uid_t) };
            let probed = unsafe { libc::setfsuid(-1i32 as libc::uid_t) };
            if real != probed {
                bail!("fsuid probe was not passed through unmodified");
            }
            Ok(())
        })
    }
}
