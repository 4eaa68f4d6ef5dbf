//! Parsing of the fstab-style mount list the `mount` helper consumes:
//! standard `src dst type opts` lines, plus two enroot-specific shorthands
//! and a handful of `x-*` extension options the stock mount table doesn't
//! know about.
use std::io::BufRead;

use nix::mount::{MntFlags, MsFlags};

#[derive(Debug, thiserror::Error)]
pub enum FstabError {
    #[error("invalid fstab entry: {0:?}")]
    InvalidEntry(String),
    #[error("failed to read fstab: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, FstabError>;

/// What to create at the mount target before mounting, from `x-create=*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateKind {
    Dir,
    File,
    /// Mirror the source's own file type.
    Auto,
}

/// A single parsed line of the fstab-style mount list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub flags: MsFlags,
    pub data: String,
    pub create: Option<CreateKind>,
    pub detach: bool,
    pub nofail: bool,
    pub silent: bool,
    pub rbind: bool,
    /// Which of the four propagation bits (`MS_SHARED`/`MS_SLAVE`/
    /// `MS_PRIVATE`/`MS_UNBINDABLE`) were requested with their literal
    /// `r`-prefixed token (`rshared`, not `shared`). An entry combining
    /// e.g. `shared,rslave` only wants `MS_REC` applied to the `slave`
    /// mount call, not the `shared` one, so this has to be tracked
    /// per-propagation-type rather than as a single entry-wide bool.
    pub rec_propagation: MsFlags,
    pub freq: i32,
    pub pass: i32,
}

/// `(name, MS_* bit, clear-instead-of-set)`, transcribed from the reference
/// implementation's `mount_opts[]` table. Options that carry no `MsFlags`
/// bit (`auto`, `user`, the `x-create=*` family, ...) are recognized but
/// contribute nothing to `flags`.
const MOUNT_OPTS: &[(&str, MsFlags, bool)] = &[
    ("async", MsFlags::MS_SYNCHRONOUS, true),
    ("atime", MsFlags::MS_NOATIME, true),
    ("bind", MsFlags::MS_BIND, false),
    ("dev", MsFlags::MS_NODEV, true),
    ("diratime", MsFlags::MS_NODIRATIME, true),
    ("dirsync", MsFlags::MS_DIRSYNC, false),
    ("exec", MsFlags::MS_NOEXEC, true),
    ("iversion", MsFlags::MS_I_VERSION, false),
    ("loud", MsFlags::MS_SILENT, true),
    ("mand", MsFlags::MS_MANDLOCK, false),
    ("noatime", MsFlags::MS_NOATIME, false),
    ("nodev", MsFlags::MS_NODEV, false),
    ("nodiratime", MsFlags::MS_NODIRATIME, false),
    ("noexec", MsFlags::MS_NOEXEC, false),
    ("noiversion", MsFlags::MS_I_VERSION, true),
    ("nomand", MsFlags::MS_MANDLOCK, true),
    ("norelatime", MsFlags::MS_RELATIME, true),
    ("nostrictatime", MsFlags::MS_STRICTATIME, true),
    ("nosuid", MsFlags::MS_NOSUID, false),
    ("private", MsFlags::MS_PRIVATE, false),
    ("rbind", union(MsFlags::MS_BIND, MsFlags::MS_REC), false),
    ("relatime", MsFlags::MS_RELATIME, false),
    ("remount", MsFlags::MS_REMOUNT, false),
    ("ro", MsFlags::MS_RDONLY, false),
    ("rw", MsFlags::MS_RDONLY, true),
    ("shared", MsFlags::MS_SHARED, false),
    ("silent", MsFlags::MS_SILENT, false),
    ("slave", MsFlags::MS_SLAVE, false),
    ("strictatime", MsFlags::MS_STRICTATIME, false),
    ("suid", MsFlags::MS_NOSUID, true),
    ("sync", MsFlags::MS_SYNCHRONOUS, false),
    ("unbindable", MsFlags::MS_UNBINDABLE, false),
    ("lazytime", MsFlags::MS_LAZYTIME, false),
    ("nolazytime", MsFlags::MS_LAZYTIME, true),
];

/// Propagation bits, checked separately because a mount can request more
/// than one of them to be set at once (`mount_propagate` applies each in
/// turn).
pub const PROPAGATION_FLAGS: MsFlags = union(
    union(MsFlags::MS_SHARED, MsFlags::MS_SLAVE),
    union(MsFlags::MS_PRIVATE, MsFlags::MS_UNBINDABLE),
);

const fn union(a: MsFlags, b: MsFlags) -> MsFlags {
    MsFlags::from_bits_truncate(a.bits() | b.bits())
}

/// Recognized no-op options that merely document intent (`/etc/fstab`
/// compatibility) or are consumed elsewhere in this module.
const IGNORED_OPTS: &[&str] = &[
    "auto", "defaults", "group", "noauto", "nofail", "nogroup", "noowner", "nouser", "nousers",
    "owner", "user", "users",
];

pub const EXTENSION_DETACH: MntFlags = MntFlags::MNT_DETACH;

/// The four recursive-propagation tokens. Kept out of [`MOUNT_OPTS`] since
/// each shares its base bit (`MS_SHARED`, ...) with the non-recursive
/// spelling (`shared`, ...); folding `MS_REC` into the table entry the way
/// `rbind` does would make `flags` alone unable to tell "recursive `slave`"
/// apart from "recursive `shared`" once both bits were ORed together, and
/// would make the table ambiguous for [`serialize_opts`] to invert.
const PROPAGATION_R_OPTS: &[(&str, MsFlags)] = &[
    ("rshared", MsFlags::MS_SHARED),
    ("rslave", MsFlags::MS_SLAVE),
    ("rprivate", MsFlags::MS_PRIVATE),
    ("runbindable", MsFlags::MS_UNBINDABLE),
];

fn is_mount_opt(opt: &str) -> bool {
    opt.contains(',')
        || MOUNT_OPTS.iter().any(|(name, _, _)| *name == opt)
        || PROPAGATION_R_OPTS.iter().any(|(name, _)| *name == opt)
        || IGNORED_OPTS.contains(&opt)
        || opt.starts_with("x-create=")
        || opt == "x-move"
        || opt == "x-detach"
}

struct ParsedOpts {
    flags: MsFlags,
    data: String,
    create: Option<CreateKind>,
    detach: bool,
    nofail: bool,
    silent: bool,
    rbind: bool,
    rec_propagation: MsFlags,
}

fn parse_opts(opts: &str) -> ParsedOpts {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    let mut create = None;
    let mut detach = false;
    let mut nofail = false;
    let mut silent = false;
    let mut rbind = false;
    let mut rec_propagation = MsFlags::empty();

    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "x-create=dir" => create = Some(CreateKind::Dir),
            "x-create=file" => create = Some(CreateKind::File),
            "x-create=auto" => create = Some(CreateKind::Auto),
            "x-detach" => detach = true,
            "x-move" => flags |= MsFlags::MS_MOVE,
            "nofail" => nofail = true,
            "silent" => silent = true,
            "loud" => silent = false,
            _ => {}
        }

        if let Some((_, bit)) = PROPAGATION_R_OPTS.iter().find(|(name, _)| *name == opt) {
            flags |= *bit;
            rec_propagation |= *bit;
            continue;
        }

        if let Some((_, flag, clear)) = MOUNT_OPTS.iter().find(|(name, _, _)| *name == opt) {
            if *clear {
                flags &= !*flag;
            } else {
                flags |= *flag;
            }
            if opt == "rbind" {
                rbind = true;
            }
            continue;
        }
        if matches!(
            opt,
            "x-create=dir" | "x-create=file" | "x-create=auto" | "x-detach" | "x-move"
        ) || IGNORED_OPTS.contains(&opt)
        {
            continue;
        }

        if !data.is_empty() {
            data.push(',');
        }
        data.extend(opt.chars());
    }

    ParsedOpts {
        flags,
        data: data.into_iter().collect(),
        create,
        detach,
        nofail,
        silent,
        rbind,
        rec_propagation,
    }
}

/// Reconstructs an options string from a parsed `(flags, data)` pair: every
/// known "set"-type option whose bit is present in `flags` (in table order),
/// then `data` verbatim. The inverse of [`parse_opts`] up to which synonym
/// each bit is spelled with (`rbind` collapses back to `bind,rbind` rather
/// than reappearing as `rbind`, since `MS_BIND|MS_REC` is what the table
/// actually records).
fn serialize_opts(flags: MsFlags, data: &str) -> String {
    let mut parts: Vec<&str> = MOUNT_OPTS
        .iter()
        .filter(|(_, _, clear)| !clear)
        .filter(|(_, flag, _)| !flag.is_empty() && flags.contains(*flag))
        .map(|(name, _, _)| *name)
        .collect();
    if !data.is_empty() {
        parts.push(data);
    }
    parts.join(",")
}

/// Default freq/pass when a line doesn't carry them.
const DEFAULT_FIELD: i32 = 0;

/// Expands one of the shorthand line shapes into the fully-qualified
/// `(source, target, fstype, opts)` quadruple a normal six-field fstab
/// line would already carry.
///
/// `SRC` alone and `SRC OPTS` both self-bind (`target == source`); the
/// only way to tell them apart from the two-field `SRC DST` shape is
/// whether the second token parses as a recognized options string.
fn expand_shorthand(tokens: &[&str]) -> (String, String, String, String) {
    match tokens {
        [] => (String::new(), String::new(), String::new(), String::new()),
        [src] => (
            (*src).to_string(),
            (*src).to_string(),
            "none".to_string(),
            "rbind,x-create=auto".to_string(),
        ),
        [src, second] => {
            if **src == *"tmpfs" {
                return (
                    "tmpfs".to_string(),
                    (*second).to_string(),
                    "tmpfs".to_string(),
                    String::new(),
                );
            }
            if is_mount_opt(second) {
                (
                    (*src).to_string(),
                    (*src).to_string(),
                    "none".to_string(),
                    (*second).to_string(),
                )
            } else {
                (
                    (*src).to_string(),
                    (*second).to_string(),
                    "none".to_string(),
                    "rbind,x-create=auto".to_string(),
                )
            }
        }
        [src, dst, third, rest @ ..] => {
            if is_mount_opt(third) {
                (
                    (*src).to_string(),
                    (*dst).to_string(),
                    "none".to_string(),
                    (*third).to_string(),
                )
            } else {
                (
                    (*src).to_string(),
                    (*dst).to_string(),
                    (*third).to_string(),
                    rest.first().map(|s| (*s).to_string()).unwrap_or_default(),
                )
            }
        }
    }
}

/// Produces a fully-resolved [`MountEntry`] from one fstab-style line's
/// whitespace-separated fields, after shorthand expansion.
fn build_entry(tokens: &[&str]) -> Result<MountEntry> {
    let (fsname, dir, fstype, opts) = expand_shorthand(tokens);

    if fsname.is_empty() || dir.is_empty() || fstype.is_empty() {
        return Err(FstabError::InvalidEntry(tokens.join(" ")));
    }

    // freq/pass trail the (up to 4) fields already consumed by shorthand
    // expansion; a bare `FS DST TYPE OPTS` line leaves them as the 5th/6th
    // whitespace tokens on the original line.
    let trailing: Vec<&str> = match tokens.len() {
        0..=4 => Vec::new(),
        n => tokens[4..n].to_vec(),
    };
    let freq = trailing
        .first()
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(DEFAULT_FIELD);
    let pass = trailing
        .get(1)
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(if freq != 0 { freq } else { DEFAULT_FIELD });

    let parsed = parse_opts(&opts);
    Ok(MountEntry {
        source: fsname,
        target: dir,
        fstype,
        flags: parsed.flags,
        data: parsed.data,
        create: parsed.create,
        detach: parsed.detach,
        nofail: parsed.nofail,
        silent: parsed.silent,
        rbind: parsed.rbind,
        rec_propagation: parsed.rec_propagation,
        freq,
        pass,
    })
}

/// Parses every non-comment, non-blank line of an fstab-style file.
///
/// Each line is whitespace-separated `source target [fstype [options [freq
/// [pass]]]]`, matching `getmntent`'s field layout; a `#`-prefixed line is
/// a comment. `pass_filter`, when given, skips lines whose effective pass
/// doesn't match (a line's pass defaults to its freq field when its own
/// pass is `0`, per the reference `mount` helper).
pub fn parse_fstab<R: BufRead>(reader: R, pass_filter: Option<i32>) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.len() > 4096 {
            return Err(FstabError::InvalidEntry(
                "line exceeds maximum fstab line length".to_string(),
            ));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let entry = build_entry(&tokens)?;
        if let Some(wanted) = pass_filter {
            if entry.pass != wanted {
                continue;
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}
