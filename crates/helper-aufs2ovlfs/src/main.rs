//! Walks a layer directory and rewrites every AUFS whiteout marker it finds
//! into the equivalent overlayfs form.
use std::path::PathBuf;

use caps::Capability;
use clap::Parser;
use corelib::capability::CapBracket;
use corelib::syscall::create_syscall;
use corelib::whiteout::{self, WhiteoutError};

const HELPER: &str = "aufs2ovlfs";

#[derive(Parser, Debug)]
#[command(name = HELPER, about = "Translate AUFS whiteouts into overlayfs whiteouts")]
struct Opts {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Directory to translate in place.
    dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum HelperError {
    #[error("{0}")]
    Whiteout(#[from] WhiteoutError),
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new(default),
        ))
        .with_writer(std::io::stderr)
        .init();
}

fn run(opts: &Opts) -> Result<(), HelperError> {
    let syscall = create_syscall();
    // `mknod` needs CAP_MKNOD, `setxattr` needs CAP_SYS_ADMIN; raise both for
    // the whole walk rather than bracketing every individual syscall site.
    let _caps = CapBracket::raise(
        syscall.as_ref(),
        &[Capability::CAP_MKNOD, Capability::CAP_SYS_ADMIN],
    )
    .map_err(|err| HelperError::Whiteout(WhiteoutError::from(err)))?;

    whiteout::translate(syscall.as_ref(), &opts.dir)?;
    Ok(())
}

fn main() {
    let opts = Opts::parse();
    init_tracing(opts.verbose);

    if let Err(err) = run(&opts) {
        eprintln!("{HELPER}: {err}");
        std::process::exit(1);
    }
}
