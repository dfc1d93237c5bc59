use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use herald_common::internal;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::warn;

use crate::error::LockError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock files older than this are assumed to belong to a dead process
pub const DEFAULT_LOCK_LIFETIME: Duration = Duration::from_secs(15 * 60);

static NEXT_CLAIM: AtomicU64 = AtomicU64::new(0);

/// A value no other lock file will contain: pid, wall clock and a counter
fn claim() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(
        "{} {nanos}.{}",
        std::process::id(),
        NEXT_CLAIM.fetch_add(1, Ordering::Relaxed)
    )
}

/// An advisory, cross-process lock on one list
///
/// The lock is a file created with `O_EXCL` holding the owner's pid and a
/// claim unique to this holder. It is released by [`ListLock::release`], or
/// when the value is dropped; either only removes the file while it still
/// carries this holder's claim.
///
/// Holders that keep the lock for a long time call [`ListLock::refresh`] so
/// the lock is not mistaken for an abandoned one.
#[derive(Debug)]
pub struct ListLock {
    path: PathBuf,
    claim: String,
    released: bool,
}

impl ListLock {
    /// Try to take the lock at `path` until `timeout` has passed
    ///
    /// A lock file older than `lifetime` is broken and taken over.
    ///
    /// # Errors
    /// [`LockError::Timeout`] if the lock stays held for the whole timeout
    pub async fn acquire(
        path: &Path,
        list: &str,
        timeout: Duration,
        lifetime: Duration,
    ) -> Result<Self, LockError> {
        let started = Instant::now();
        let claim = claim();

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(format!("{claim}\n").as_bytes()).await?;
                    internal!("Locked {list}");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        claim,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }

            if break_stale(path, &claim, lifetime).await? {
                warn!(list, lock = %path.display(), "Broke stale list lock");
                continue;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    list: list.to_string(),
                    waited,
                });
            }

            tokio::time::sleep(POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the lock as in use now, restarting its lifetime
    ///
    /// # Errors
    /// If the lock file no longer holds this claim, or cannot be touched
    pub async fn refresh(&self) -> Result<(), LockError> {
        if !self.is_ours().await {
            return Err(LockError::Lost(self.path.clone()));
        }

        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.into_std().await.set_modified(SystemTime::now())?;
        Ok(())
    }

    async fn is_ours(&self) -> bool {
        tokio::fs::read_to_string(&self.path)
            .await
            .is_ok_and(|content| content.trim_end() == self.claim)
    }

    /// Release the lock
    ///
    /// # Errors
    /// If the lock file cannot be removed
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;

        if !self.is_ours().await {
            warn!(lock = %self.path.display(), "List lock was lost while held");
            return Ok(());
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(lock = %self.path.display(), "List lock vanished while held");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for ListLock {
    fn drop(&mut self) {
        if !self.released
            && std::fs::read_to_string(&self.path)
                .is_ok_and(|content| content.trim_end() == self.claim)
        {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn is_stale(path: &Path, lifetime: Duration) -> bool {
    tokio::fs::metadata(path)
        .await
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > lifetime)
}

/// Remove the lock at `path` if it has outlived `lifetime`
///
/// The lock is first renamed aside, which only one contender can do, and
/// judged again under its new name. A lock that turns out to be fresh,
/// because another contender replaced the stale one in between, is linked
/// back into place.
async fn break_stale(path: &Path, claim: &str, lifetime: Duration) -> Result<bool, LockError> {
    if !is_stale(path, lifetime).await {
        return Ok(false);
    }

    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".broken.{}", claim.replace(' ', "-")));
    let aside = PathBuf::from(aside);

    match tokio::fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    }

    let broken = is_stale(&aside, lifetime).await;
    if !broken {
        match tokio::fs::hard_link(&aside, path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                let _ = tokio::fs::remove_file(&aside).await;
                return Err(err.into());
            }
        }
    }

    tokio::fs::remove_file(&aside).await?;
    Ok(broken)
}
