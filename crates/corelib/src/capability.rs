//! Capability brackets: narrow the process's effective capability set to
//! exactly what a privileged operation needs, then drop back down.
//!
//! The helpers in this workspace run with a handful of capabilities raised
//! (via the ambient set, see [`crate::namespace::raise_ambient_capabilities`])
//! while otherwise running as an unprivileged user. Each privileged syscall
//! site brackets itself: raise only the capability it needs into the
//! effective set, perform the syscall, then drop back to empty effective.
use caps::{CapSet, Capability, CapsHashSet};
use nix::errno::Errno;

use crate::syscall::{Syscall, SyscallError};

/// Where the kernel publishes the highest capability number it knows
/// about; read once at process start so `drop_privileges` knows how much
/// of the bounding set to clear.
const CAP_LAST_CAP_PATH: &str = "/proc/sys/kernel/cap_last_cap";

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("syscall failed: {0}")]
    Syscall(#[from] SyscallError),
    #[error("failed to read {CAP_LAST_CAP_PATH}: {0}")]
    ReadCapLastCap(#[source] std::io::Error),
    #[error("invalid content in {CAP_LAST_CAP_PATH}: {0:?}")]
    InvalidCapLastCap(String),
    #[error("prctl(PR_SET_NO_NEW_PRIVS) failed: {0}")]
    NoNewPrivs(Errno),
}

type Result<T> = std::result::Result<T, CapabilityError>;

fn set_of(caps: &[Capability]) -> CapsHashSet {
    caps.iter().copied().collect()
}

/// Reads `/proc/sys/kernel/cap_last_cap`, the highest capability number
/// the running kernel defines.
pub fn read_cap_last_cap() -> Result<u8> {
    let content =
        std::fs::read_to_string(CAP_LAST_CAP_PATH).map_err(CapabilityError::ReadCapLastCap)?;
    content
        .trim()
        .parse::<u8>()
        .map_err(|_| CapabilityError::InvalidCapLastCap(content))
}

fn set_no_new_privs() -> Result<()> {
    // Not wrapped by the `caps` crate; go straight to `prctl(2)`.
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(CapabilityError::NoNewPrivs(Errno::last()));
    }
    Ok(())
}

/// Raises `caps` into the effective set for the lifetime of this guard, then
/// restores an empty effective set on drop.
///
/// Errors from the drop-side restore are logged rather than propagated,
/// mirroring the raise/lower bracket used throughout this workspace's C
/// ancestor: a failure to re-lower a capability should not mask whatever
/// error the bracketed operation itself produced.
pub struct CapBracket<'a> {
    syscall: &'a dyn Syscall,
}

impl<'a> CapBracket<'a> {
    pub fn raise(syscall: &'a dyn Syscall, caps: &[Capability]) -> Result<Self, SyscallError> {
        syscall.set_capability(CapSet::Effective, &set_of(caps))?;
        Ok(CapBracket { syscall })
    }
}

impl Drop for CapBracket<'_> {
    fn drop(&mut self) {
        if let Err(err) = self
            .syscall
            .set_capability(CapSet::Effective, &CapsHashSet::new())
        {
            tracing::warn!(%err, "failed to lower effective capabilities");
        }
    }
}

/// Resets the effective set to match the full permitted set.
///
/// Used right after a uid change: the kernel clears the permitted set's
/// effective bits on `setresuid`, so anything still needed has to be
/// re-raised explicitly.
pub fn reset_effective(syscall: &dyn Syscall) -> Result<(), SyscallError> {
    tracing::debug!("resetting effective capabilities to permitted set");
    let permitted = caps::read(None, CapSet::Permitted)?;
    syscall.set_capability(CapSet::Effective, &permitted)
}

/// Drops every capability outside of `keep` from the bounding set, so the
/// process (and anything it execs) can never regain them even via a setuid
/// binary.
pub fn drop_bounding_set_except(
    syscall: &dyn Syscall,
    keep: &[Capability],
) -> Result<()> {
    tracing::debug!(?keep, "dropping bounding capabilities");
    syscall
        .set_capability(CapSet::Bounding, &set_of(keep))
        .map_err(CapabilityError::from)
}

/// Final privilege-drop performed by every helper right before it execs
/// untrusted code: sets `no_new_privs`, clears the bounding set down to
/// nothing for a non-root caller, and empties permitted/effective/
/// inheritable.
///
/// `last_cap` (from [`read_cap_last_cap`]) documents how much of the
/// bounding set the reference implementation clears (`0..=last_cap`); this
/// crate drops every capability the `caps` crate knows about instead of
/// looping over raw numbers, which covers the same ground without a
/// kernel-version-dependent numeric cap table.
pub fn drop_privileges(syscall: &dyn Syscall, last_cap: u8) -> Result<()> {
    tracing::debug!(last_cap, "dropping privileges");
    set_no_new_privs()?;

    // A root caller returns right after no_new_privs: the reference
    // implementation never touches the bounding/permitted/effective/
    // inheritable sets for `geteuid() == 0`.
    if nix::unistd::geteuid().is_root() {
        return Ok(());
    }

    drop_bounding_set_except(syscall, &[])?;
    syscall.set_capability(CapSet::Permitted, &CapsHashSet::new())?;
    syscall.set_capability(CapSet::Effective, &CapsHashSet::new())?;
    syscall.set_capability(CapSet::Inheritable, &CapsHashSet::new())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn test_cap_bracket_raises_and_lowers() {
        let test_command = TestHelperSyscall::default();
        {
            let _bracket =
                CapBracket::raise(&test_command, &[Capability::CAP_SYS_ADMIN]).unwrap();
        }
        let calls = test_command.get_set_capability_args();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1.contains(&Capability::CAP_SYS_ADMIN));
        assert!(calls[1].1.is_empty());
    }

    #[test]
    fn test_reset_effective() {
        let test_command = TestHelperSyscall::default();
        let permitted = caps::read(None, CapSet::Permitted).unwrap();
        assert!(reset_effective(&test_command).is_ok());
        let calls = test_command.get_set_capability_args();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, permitted);
    }

    #[test]
    fn test_read_cap_last_cap_parses_proc_file() {
        // Every Linux kernel this workspace targets exposes this file;
        // just assert it parses rather than asserting a specific value.
        assert!(read_cap_last_cap().is_ok());
    }

    #[test]
    fn test_drop_privileges_clears_all_sets_when_non_root() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let test_command = TestHelperSyscall::default();
        drop_privileges(&test_command, 40).unwrap();
        let calls = test_command.get_set_capability_args();
        // Bounding + permitted + effective + inheritable.
        assert!(calls.iter().all(|(_, v)| v.is_empty()));
        assert!(calls
            .iter()
            .any(|(set, _)| *set as u8 == CapSet::Bounding as u8));
        assert!(calls
            .iter()
            .any(|(set, _)| *set as u8 == CapSet::Permitted as u8));
        assert!(calls
            .iter()
            .any(|(set, _)| *set as u8 == CapSet::Effective as u8));
        assert!(calls
            .iter()
            .any(|(set, _)| *set as u8 == CapSet::Inheritable as u8));
    }

    #[test]
    fn test_drop_privileges_is_noop_past_no_new_privs_when_root() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let test_command = TestHelperSyscall::default();
        drop_privileges(&test_command, 40).unwrap();
        assert!(test_command.get_set_capability_args().is_empty());
    }
}
