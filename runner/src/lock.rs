use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{RunnerError, RunnerResult};

/// Take the exclusive instance lock on `path` without waiting.
///
/// Fails if another runner already serves the same base directory. The
/// returned guard holds the lock until dropped.
pub async fn acquire(path: PathBuf) -> RunnerResult<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RunnerError::Internal(format!("open lock {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, e)| {
            if e == Errno::EWOULDBLOCK {
                RunnerError::Config(format!(
                    "another runner holds {}; is it already serving this base_dir?",
                    path.display()
                ))
            } else {
                RunnerError::Internal(format!("flock {}: {e}", path.display()))
            }
        })
    })
    .await
    .map_err(|e| RunnerError::Internal(format!("lock task: {e}")))?
}
