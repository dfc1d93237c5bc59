use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    bounce::BounceRegistry,
    config::ListConfig,
    error::{ListError, Result},
    list::{ListState, MailList, STATE_FILE, write_state},
    lock::DEFAULT_LOCK_LIFETIME,
    membership::Membership,
};

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/herald/lists")
}

const fn default_lock_lifetime_secs() -> u64 {
    DEFAULT_LOCK_LIFETIME.as_secs()
}

/// Where list state lives: one directory per list under `root`
///
/// ```ron
/// lists: (
///     root: "/var/lib/herald/lists",
///     lock_lifetime_secs: 900,
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ListStore {
    #[serde(default = "default_root")]
    root: PathBuf,

    /// Locks older than this are considered abandoned and broken
    #[serde(default = "default_lock_lifetime_secs")]
    lock_lifetime_secs: u64,
}

impl Default for ListStore {
    fn default() -> Self {
        Self::new(default_root())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

    if valid {
        Ok(())
    } else {
        Err(ListError::InvalidName(name.to_string()))
    }
}

impl ListStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_lifetime_secs: default_lock_lifetime_secs(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    const fn lock_lifetime(&self) -> Duration {
        Duration::from_secs(self.lock_lifetime_secs)
    }

    /// Open a list without locking it
    ///
    /// # Errors
    /// [`ListError::UnknownList`] when there is no such list, or the list's
    /// state cannot be read
    pub async fn open(&self, name: &str) -> Result<MailList> {
        validate_name(name)?;

        let dir = self.root.join(name);
        let state = MailList::load(&dir, name).await?;
        Ok(MailList::new(dir, state, self.lock_lifetime()))
    }

    /// Names of every list in the store, sorted
    ///
    /// # Errors
    /// If the store directory cannot be read
    pub async fn names(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };

            if validate_name(&name).is_ok() && entry.path().join(STATE_FILE).exists() {
                names.push(name);
            }
        }

        names.sort_unstable();
        Ok(names)
    }

    /// Create a new, empty list. The returned handle is not locked.
    ///
    /// # Errors
    /// If the name is invalid, the list already exists, or its state cannot
    /// be written
    pub async fn create(&self, config: ListConfig) -> Result<MailList> {
        validate_name(&config.name)?;

        let dir = self.root.join(&config.name);
        if dir.join(STATE_FILE).exists() {
            return Err(ListError::AlreadyExists(config.name));
        }
        tokio::fs::create_dir_all(&dir).await?;

        let state = ListState {
            config,
            members: Membership::default(),
            bounces: BounceRegistry::default(),
        };

        write_state(&dir, &state).await?;

        Ok(MailList::new(dir, state, self.lock_lifetime()))
    }
}
