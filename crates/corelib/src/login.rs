//! The `--login` init procedure `switchroot` optionally runs before
//! exec'ing a shell: environment population from `login.defs`, passwd and
//! locale lookups, resource limits, and lastlog/utmp bookkeeping.
//!
//! Every failure in here is a warning, not a fatal error (spec §4.5.1): a
//! helper that can't read `/etc/login.defs` or look up a passwd entry
//! still produces a best-effort environment rather than aborting the
//! switch. Callers collect [`LoginEnv::warnings`] and log them; nothing in
//! this module returns early on a sub-step failure.
use std::collections::HashMap;
use std::io::{BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::syscall::{PasswdEntry, Syscall};

pub const DEFAULT_NOLOGINS_FILE: &str = "/etc/nologin";
pub const DEFAULT_MOTD_FILE: &str = "/etc/motd";
pub const DEFAULT_HUSHLOGIN_FILE: &str = ".hushlogin";
pub const DEFAULT_LOGIN_DEFS: &str = "/etc/login.defs";
pub const DEFAULT_LOCALE_CONF: &str = "/etc/locale.conf";
pub const DEFAULT_LASTLOG: &str = "/var/log/lastlog";

const STD_PATH: &str = "/usr/local/bin:/bin:/usr/bin";
const SU_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/sbin:/bin:/usr/bin";

/// The locale variables `locale.conf` is allowed to set; anything else in
/// the file is ignored (spec: "only the standard locale variable names").
const LOCALE_VARS: &[&str] = &[
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "LC_COLLATE",
    "LC_TIME",
    "LC_NUMERIC",
    "LC_MONETARY",
    "LC_MESSAGES",
    "LC_PAPER",
    "LC_NAME",
    "LC_ADDRESS",
    "LC_TELEPHONE",
    "LC_MEASUREMENT",
    "LC_IDENTIFICATION",
];

/// `KEY=VAL` / `KEY VAL` parameter map loaded from `login.defs` or
/// `locale.conf`-shaped files: comments, blank lines, and backslash-escaped
/// line continuations are honored, and a trailing `#...` on a value line
/// is stripped like a comment too.
#[derive(Debug, Default, Clone)]
pub struct ParamMap(HashMap<String, String>);

impl ParamMap {
    pub fn load<R: BufRead>(reader: R) -> std::io::Result<Self> {
        let mut map = HashMap::new();
        let mut pending = String::new();

        for line in reader.lines() {
            let mut line = line?;
            if !pending.is_empty() {
                line = std::mem::take(&mut pending) + &line;
            }

            let trimmed = line.trim_end();
            if let Some(stripped) = trimmed.strip_suffix('\\') {
                pending = stripped.to_string();
                continue;
            }

            let trimmed = trimmed.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let trimmed = match trimmed.find('#') {
                Some(idx) => trimmed[..idx].trim_end(),
                None => trimmed,
            };

            let (key, val) = if let Some(idx) = trimmed.find('=') {
                (&trimmed[..idx], trimmed[idx + 1..].trim())
            } else if let Some(idx) = trimmed.find(char::is_whitespace) {
                (&trimmed[..idx], trimmed[idx..].trim())
            } else {
                continue;
            };

            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            map.insert(key.to_string(), val.trim_matches('"').to_string());
        }

        Ok(ParamMap(map))
    }

    /// Loads an empty map, used when a config file is optional and absent.
    pub fn empty() -> Self {
        ParamMap(HashMap::new())
    }

    pub fn load_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::load(std::io::BufReader::new(file))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }
}

/// Everything the login procedure produced: environment variables to set,
/// the umask and file-size limit to apply, the directory to `chdir` into,
/// and any non-fatal warnings collected along the way.
#[derive(Debug, Clone, Default)]
pub struct LoginEnv {
    pub vars: Vec<(String, String)>,
    pub umask: Option<u32>,
    /// `None` means "leave RLIMIT_FSIZE alone" (no `ULIMIT` configured);
    /// `Some(None)` would be infinity, represented here as `u64::MAX`.
    pub rlimit_fsize: Option<u64>,
    pub home: Option<String>,
    pub home_required: bool,
    pub warnings: Vec<String>,
    /// `true` once a nologin file was found and printed for a non-root
    /// user; the caller should print its contents and exit 0 without
    /// proceeding any further into the login sequence.
    pub nologin: Option<PathBuf>,
}

impl LoginEnv {
    fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!(%msg, "login setup warning");
        self.warnings.push(msg);
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Picks the shell to exec per §4.5.1: `FAKE_SHELL` if executable, else
/// `$SHELL` if executable, else `/bin/sh`.
pub fn choose_shell(login_defs: &ParamMap, env_shell: Option<&str>) -> PathBuf {
    if let Some(fake) = login_defs.get("FAKE_SHELL") {
        let p = PathBuf::from(fake);
        if is_executable(&p) {
            return p;
        }
    }
    if let Some(shell) = env_shell {
        let p = PathBuf::from(shell);
        if is_executable(&p) {
            return p;
        }
    }
    PathBuf::from("/bin/sh")
}

/// Builds the final `execv` argv for the chosen shell, applying §4.5.1's
/// command-selection policy: an `/etc/rc` present wins outright; then a
/// multi-word command string; then a non-executable (likely a script
/// without `+x`) first argument synthesizes `sh -c 'exec "$@"'`; otherwise
/// the command is passed through as a shell-script invocation.
pub fn build_shell_argv(shell: &Path, login: bool, command: &[String], rc_path: &Path) -> Vec<String> {
    let argv0 = format!("{}{}", if login { "-" } else { "" }, shell.display());

    if rc_path.exists() {
        return vec![argv0, rc_path.display().to_string()];
    }

    if command.len() == 1 && command[0].contains(' ') {
        return vec![argv0, "-c".to_string(), command[0].clone(), shell.display().to_string()];
    }

    match command.first() {
        Some(first) if !is_executable(Path::new(first)) => {
            let mut argv = vec![
                argv0,
                "-c".to_string(),
                "exec \"$@\"".to_string(),
                shell.display().to_string(),
            ];
            argv.extend(command.iter().cloned());
            argv
        }
        Some(_) => {
            let mut argv = vec![argv0];
            argv.extend(command.iter().cloned());
            argv
        }
        None => vec![argv0],
    }
}

/// Parses a `UMASK`-shaped octal string (`login.defs`'s own format).
fn parse_octal_umask(s: &str) -> Option<u32> {
    u32::from_str_radix(s, 8).ok()
}

/// Parses `ULIMIT` (512-byte blocks, `-1` meaning infinity) into bytes.
fn parse_ulimit_blocks(s: &str) -> Option<u64> {
    let n: i64 = s.trim().parse().ok()?;
    if n < 0 {
        Some(u64::MAX)
    } else {
        Some(n as u64 * 512)
    }
}

/// Reads the first line of `path`, trimmed, used by `ENV_TZ` when it names
/// an absolute path instead of a literal timezone string.
fn read_first_line(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    content.lines().next().map(str::trim).map(str::to_owned)
}

/// Runs the full `--login` environment setup described in spec §4.5.1.
///
/// `existing_env` is consulted for "only if not already set" fields
/// (`HOME`/`SHELL`/`USER`) without this module touching the real process
/// environment directly, so it stays unit-testable; the caller applies
/// `LoginEnv::vars` to the process (`clearenv`+`setenv`, or simply
/// `std::env::set_var`) afterwards.
#[allow(clippy::too_many_arguments)]
pub fn run_login(
    syscall: &dyn Syscall,
    login_defs: &ParamMap,
    locale_conf: Option<&ParamMap>,
    euid: u32,
    mapped_uid: u32,
    existing_env: &HashMap<String, String>,
    nologins_file: &Path,
) -> LoginEnv {
    let mut out = LoginEnv::default();

    if euid != 0 && nologins_file.exists() {
        out.nologin = Some(nologins_file.to_path_buf());
        return out;
    }

    out.vars.push(("TERM".to_string(), "dumb".to_string()));

    let effective_pw = syscall.get_passwd(euid);
    if effective_pw.is_none() {
        out.warn(format!("no passwd entry for uid {euid}"));
    }
    let mapped_pw = syscall.get_passwd(mapped_uid);

    if let Some(pw) = &effective_pw {
        if !existing_env.contains_key("HOME") {
            out.vars.push(("HOME".to_string(), pw.dir.clone()));
        }
        if !existing_env.contains_key("SHELL") {
            out.vars.push(("SHELL".to_string(), pw.shell.clone()));
        }
        if !existing_env.contains_key("USER") {
            out.vars.push(("USER".to_string(), pw.name.clone()));
        }
        out.home = Some(pw.dir.clone());
    }

    if let Some(pw) = &mapped_pw {
        out.vars.push(("LOGNAME".to_string(), pw.name.clone()));
    }

    let path = if euid == 0 {
        login_defs.get_or("ENV_SUPATH", SU_PATH)
    } else {
        login_defs.get_or("ENV_PATH", STD_PATH)
    };
    out.vars.push(("PATH".to_string(), path.to_string()));

    if let Some(pw) = &effective_pw {
        let mail = if let Some(dir) = login_defs.get("MAIL_DIR") {
            Some(format!("{}/{}", dir.trim_end_matches('/'), pw.name))
        } else {
            login_defs.get("MAIL_FILE").map(str::to_owned)
        };
        if let Some(mail) = mail {
            out.vars.push(("MAIL".to_string(), mail));
        }
    }

    if let Some(tz) = login_defs.get("ENV_TZ") {
        let resolved = if tz.starts_with('/') {
            match read_first_line(Path::new(tz)) {
                Some(line) => Some(line),
                None => {
                    out.warn(format!("failed to read TZ file {tz}"));
                    None
                }
            }
        } else {
            Some(tz.to_string())
        };
        if let Some(tz) = resolved {
            out.vars.push(("TZ".to_string(), tz));
        }
    }

    if let Some(locale) = locale_conf {
        for &var in LOCALE_VARS {
            if let Some(val) = locale.get(var) {
                out.vars.push((var.to_string(), val.to_string()));
            }
        }
    }

    let mut umask = login_defs.get("UMASK").and_then(parse_octal_umask);
    if login_defs.get("USERGROUPS_ENAB") == Some("yes") {
        if let Some(pw) = &effective_pw {
            let primary_group_matches_user = syscall
                .get_group_name(pw.gid)
                .map(|name| name == pw.name)
                .unwrap_or(false);
            if primary_group_matches_user && umask.unwrap_or(0o022) == 0o022 {
                umask = Some(0o002);
            }
        }
    }
    out.umask = umask;

    out.rlimit_fsize = login_defs.get("ULIMIT").and_then(parse_ulimit_blocks);

    out.home_required = login_defs.get("DEFAULT_HOME").is_none();

    out
}

/// `UT_LINESIZE`/`UT_HOSTSIZE`-equivalent fixed widths for the lastlog
/// record (glibc's `struct lastlog`).
const UT_LINESIZE: usize = 32;
const UT_HOSTSIZE: usize = 256;
const LASTLOG_RECORD_SIZE: usize = 4 + UT_LINESIZE + UT_HOSTSIZE;

fn pack_fixed(buf: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(buf.len() + (width - n), 0);
}

/// Writes a `lastlog` record for `uid` at its fixed offset
/// (`uid * sizeof(record)`), matching the binary layout
/// `{time: i32, line: char[32], host: char[256]}`.
pub fn record_lastlog(path: &Path, uid: u32, tty: &str, time: i64) -> std::io::Result<()> {
    let mut record = Vec::with_capacity(LASTLOG_RECORD_SIZE);
    record.extend_from_slice(&(time as i32).to_ne_bytes());
    pack_fixed(&mut record, tty, UT_LINESIZE);
    pack_fixed(&mut record, "localhost", UT_HOSTSIZE);
    debug_assert_eq!(record.len(), LASTLOG_RECORD_SIZE);

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)?;
    file.seek(SeekFrom::Start(uid as u64 * LASTLOG_RECORD_SIZE as u64))?;
    file.write_all(&record)
}

/// Reads back a previously written lastlog record, for tests.
pub fn read_lastlog(path: &Path, uid: u32) -> std::io::Result<(i64, String, String)> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(uid as u64 * LASTLOG_RECORD_SIZE as u64))?;
    let mut record = vec![0u8; LASTLOG_RECORD_SIZE];
    file.read_exact(&mut record)?;
    let time = i32::from_ne_bytes(record[0..4].try_into().unwrap()) as i64;
    let line_end = record[4..4 + UT_LINESIZE]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(UT_LINESIZE);
    let line = String::from_utf8_lossy(&record[4..4 + line_end]).into_owned();
    let host_start = 4 + UT_LINESIZE;
    let host_end = record[host_start..host_start + UT_HOSTSIZE]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(UT_HOSTSIZE);
    let host = String::from_utf8_lossy(&record[host_start..host_start + host_end]).into_owned();
    Ok((time, line, host))
}

fn truncate_into(dst: &mut [libc::c_char], src: &str) {
    for (slot, byte) in dst.iter_mut().zip(src.as_bytes().iter()) {
        *slot = *byte as libc::c_char;
    }
}

/// Records a login session in `utmp` and appends it to `wtmp`, via the
/// platform's standard `utmpx` API rather than hand-rolled binary layouts.
/// Best-effort: failures are logged and otherwise ignored, matching the
/// rest of the login procedure's "never block the shell on bookkeeping"
/// policy.
pub fn record_session(user: &str, tty: &str, pid: i32) {
    unsafe {
        let mut entry: libc::utmpx = std::mem::zeroed();
        entry.ut_type = libc::USER_PROCESS;
        entry.ut_pid = pid;
        truncate_into(&mut entry.ut_line, tty);
        truncate_into(&mut entry.ut_user, user);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        entry.ut_tv.tv_sec = now as _;

        libc::setutxent();
        if libc::pututxline(&entry).is_null() {
            tracing::warn!("failed to write utmp entry");
        }
        libc::endutxent();
        if let Ok(wtmp_path) = std::ffi::CString::new("/var/log/wtmp") {
            libc::updwtmpx(wtmp_path.as_ptr(), &entry);
        }
    }
}

/// Reads the colon-separated `MOTD_FILE` list and returns the concatenated
/// contents of whichever files exist, unless `hushlogin_file` is present.
pub fn motd_text(login_defs: &ParamMap, home: &Path) -> Option<String> {
    if home.join(DEFAULT_HUSHLOGIN_FILE).exists() {
        return None;
    }
    let files = login_defs.get_or("MOTD_FILE", DEFAULT_MOTD_FILE);
    let mut out = String::new();
    for f in files.split(':') {
        if let Ok(content) = std::fs::read_to_string(f) {
            out.push_str(&content);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use std::io::Cursor;

    #[test]
    fn test_param_map_key_val() {
        let map = ParamMap::load(Cursor::new("FOO=bar\nBAZ qux\n# comment\n\n")).unwrap();
        assert_eq!(map.get("FOO"), Some("bar"));
        assert_eq!(map.get("BAZ"), Some("qux"));
        assert_eq!(map.get("comment"), None);
    }

    #[test]
    fn test_param_map_continuation_and_trailing_comment() {
        let map = ParamMap::load(Cursor::new("FOO=one \\\ntwo # trailing\n")).unwrap();
        assert_eq!(map.get("FOO"), Some("one two"));
    }

    #[test]
    fn test_param_map_quoted_value() {
        let map = ParamMap::load(Cursor::new("LANG=\"en_US.UTF-8\"\n")).unwrap();
        assert_eq!(map.get("LANG"), Some("en_US.UTF-8"));
    }

    #[test]
    fn test_choose_shell_falls_back_to_bin_sh() {
        let defs = ParamMap::load(Cursor::new("FAKE_SHELL=/nonexistent/shell\n")).unwrap();
        assert_eq!(choose_shell(&defs, Some("/nonexistent/also")), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_build_shell_argv_passthrough() {
        let argv = build_shell_argv(
            Path::new("/bin/sh"),
            false,
            &["/bin/true".to_string()],
            Path::new("/nonexistent/rc"),
        );
        assert_eq!(argv, vec!["/bin/sh".to_string(), "/bin/true".to_string()]);
    }

    #[test]
    fn test_build_shell_argv_non_executable_first_arg_synthesizes_exec() {
        let argv = build_shell_argv(
            Path::new("/bin/sh"),
            true,
            &["/definitely/not/a/binary".to_string()],
            Path::new("/nonexistent/rc"),
        );
        assert_eq!(argv[0], "-/bin/sh");
        assert_eq!(argv[1], "-c");
        assert_eq!(argv[2], "exec \"$@\"");
        assert_eq!(argv[3], "/bin/sh");
        assert_eq!(argv[4], "/definitely/not/a/binary");
    }

    #[test]
    fn test_build_shell_argv_spaced_command() {
        let argv = build_shell_argv(
            Path::new("/bin/sh"),
            false,
            &["echo hello".to_string()],
            Path::new("/nonexistent/rc"),
        );
        assert_eq!(
            argv,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo hello".to_string(),
                "/bin/sh".to_string()
            ]
        );
    }

    #[test]
    fn test_run_login_sets_core_vars() {
        let syscall = TestHelperSyscall::default();
        let defs = ParamMap::empty();
        let env = run_login(
            &syscall,
            &defs,
            None,
            1000,
            1000,
            &HashMap::new(),
            Path::new("/nonexistent/nologin"),
        );
        assert!(env.nologin.is_none());
        let as_map: HashMap<_, _> = env.vars.iter().cloned().collect();
        assert_eq!(as_map.get("TERM"), Some(&"dumb".to_string()));
        assert_eq!(as_map.get("HOME"), Some(&"/home/nobody".to_string()));
        assert_eq!(as_map.get("USER"), Some(&"nobody".to_string()));
        assert_eq!(as_map.get("LOGNAME"), Some(&"nobody".to_string()));
        assert_eq!(as_map.get("PATH"), Some(&STD_PATH.to_string()));
    }

    #[test]
    fn test_run_login_respects_existing_env() {
        let syscall = TestHelperSyscall::default();
        let defs = ParamMap::empty();
        let mut existing = HashMap::new();
        existing.insert("HOME".to_string(), "/custom/home".to_string());
        let env = run_login(
            &syscall,
            &defs,
            None,
            1000,
            1000,
            &existing,
            Path::new("/nonexistent/nologin"),
        );
        let as_map: HashMap<_, _> = env.vars.iter().cloned().collect();
        assert!(!as_map.contains_key("HOME"));
    }

    #[test]
    fn test_run_login_root_uses_supath() {
        let syscall = TestHelperSyscall::default();
        let defs = ParamMap::empty();
        let env = run_login(
            &syscall,
            &defs,
            None,
            0,
            0,
            &HashMap::new(),
            Path::new("/nonexistent/nologin"),
        );
        let as_map: HashMap<_, _> = env.vars.iter().cloned().collect();
        assert_eq!(as_map.get("PATH"), Some(&SU_PATH.to_string()));
    }

    #[test]
    fn test_run_login_nologin_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let nologin = dir.path().join("nologin");
        std::fs::write(&nologin, "sorry, no logins\n").unwrap();
        let syscall = TestHelperSyscall::default();
        let defs = ParamMap::empty();
        let env = run_login(&syscall, &defs, None, 1000, 1000, &HashMap::new(), &nologin);
        assert_eq!(env.nologin, Some(nologin));
        assert!(env.vars.is_empty());
    }

    #[test]
    fn test_ulimit_blocks_and_infinity() {
        assert_eq!(parse_ulimit_blocks("10"), Some(5120));
        assert_eq!(parse_ulimit_blocks("-1"), Some(u64::MAX));
    }

    #[test]
    fn test_lastlog_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lastlog");
        record_lastlog(&path, 42, "pts/0", 1_700_000_000).unwrap();
        let (time, line, host) = read_lastlog(&path, 42).unwrap();
        assert_eq!(time, 1_700_000_000);
        assert_eq!(line, "pts/0");
        assert_eq!(host, "localhost");
    }

    #[test]
    fn test_lastlog_offsets_dont_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lastlog");
        record_lastlog(&path, 1, "tty1", 100).unwrap();
        record_lastlog(&path, 2, "tty2", 200).unwrap();
        assert_eq!(read_lastlog(&path, 1).unwrap().1, "tty1");
        assert_eq!(read_lastlog(&path, 2).unwrap().1, "tty2");
    }
}
