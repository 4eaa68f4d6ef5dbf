use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;

use anyhow::{Context, Result};
use nix::sys::wait;
use nix::unistd::{self, ForkResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct TestError {
    source: Option<Box<TestError>>,
    description: String,
}

impl TestError {
    pub fn new<T>(e: &T) -> TestError
    where
        T: ?Sized + std::error::Error,
    {
        TestError {
            description: e.to_string(),
            source: e.source().map(|s| Box::new(TestError::new(s))),
        }
    }
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl std::error::Error for TestError {
    fn source(&self) -> Option<&(dyn 'static + std::error::Error)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn 'static + std::error::Error))
    }
}

type TestResult = Result<(), TestError>;

/// Runs `cb` in a forked child process and waits for its result.
///
/// Several of this workspace's operations (unsharing namespaces, dropping
/// capabilities) are irreversible for the calling process, so exercising
/// them in a test needs a throwaway child rather than the test process
/// itself.
pub fn test_in_child_process<F>(cb: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + std::panic::UnwindSafe,
{
    let (read_fd, write_fd) = unistd::pipe().context("failed to create pipe")?;

    match unsafe { unistd::fork()? } {
        ForkResult::Parent { child } => {
            unistd::close(write_fd).context("failed to close write end in parent")?;
            let mut file = unsafe { std::fs::File::from_raw_fd(read_fd) };
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .context("failed to read result from child process")?;
            wait::waitpid(child, None).context("failed to wait for the child process")?;

            let res: TestResult = serde_json::from_slice(&buf)
                .context("failed to deserialize result from child process")?;
            res.map_err(anyhow::Error::from)
                .context("failed running function in the child process")?;
        }
        ForkResult::Child => {
            unistd::close(read_fd).ok();
            let test_result: TestResult = match std::panic::catch_unwind(cb) {
                Ok(ret) => ret.map_err(|err| TestError::new(&*err)),
                Err(err) => Err(TestError::new(&*anyhow::anyhow!(
                    "the child process panicked: {:?}",
                    err
                ))),
            };

            let mut file = unsafe { std::fs::File::from_raw_fd(write_fd) };
            let _ = file.write_all(&serde_json::to_vec(&test_result).unwrap_or_default());
            std::process::exit(0);
        }
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn test_child_process() -> Result<()> {
        test_in_child_process(|| Ok(()))?;
        if test_in_child_process(|| Err(anyhow::anyhow!("test error"))).is_ok() {
            bail!("expecting the child process to return an error")
        }

        Ok(())
    }

    #[test]
    fn test_panic_child_process() -> Result<()> {
        if test_in_child_process(|| {
            assert!(false, "this is a panic test");
            Ok(())
        })
        .is_ok()
        {
            bail!("expecting the child process to panic")
        }

        Ok(())
    }
}
