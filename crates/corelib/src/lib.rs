#![cfg_attr(coverage, feature(no_coverage))]

pub mod capability;
pub mod fstab;
pub mod login;
pub mod mountengine;
pub mod namespace;
pub mod path;
pub mod seccomp;
pub mod syscall;
pub mod whiteout;
