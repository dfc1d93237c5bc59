use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use herald_common::{Message, Metadata, internal, queued};
use parking_lot::Mutex;
use tokio::fs;
use tracing::{error, warn};

use crate::{Result, SerializationError, SpoolError, token::QueueToken};

const MESSAGE_EXT: &str = "eml";
const METADATA_EXT: &str = "json";
const BACKUP_SUFFIX: &str = ".bak";
const BAD_SUFFIX: &str = ".bad";
const TEMP_PREFIX: &str = ".tmp_";

/// A directory-backed queue of `(Message, Metadata)` entries
///
/// Each entry is two files sharing a [`QueueToken`]:
/// - `{token}.eml` holds the message in wire form
/// - `{token}.json` holds the metadata mapping
///
/// Both halves are written to `.tmp_` names first and renamed into place,
/// message first. The metadata file is the commit marker: only tokens with a
/// metadata file are ever listed, so a crash part way through an enqueue
/// leaves an unlisted half that [`Switchboard::reap_orphans`] removes.
///
/// Dequeued entries are not deleted straight away. They are renamed to
/// `{token}.{ext}.bak` and only removed by [`Switchboard::finish`], so an
/// entry being dispatched when the process dies is put back in the queue by
/// [`Switchboard::recover_backups`] on the next start.
pub struct Switchboard {
    path: PathBuf,
    slice: u32,
    slices: u32,
    generator: Mutex<ulid::Generator>,
}

impl std::fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchboard")
            .field("path", &self.path)
            .field("slice", &self.slice)
            .field("slices", &self.slices)
            .finish_non_exhaustive()
    }
}

impl Switchboard {
    /// Open the whole of the queue at `path`, creating the directory if needed
    ///
    /// # Errors
    /// If the directory cannot be created, or `path` is not a directory
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::sliced(path, 0, 1)
    }

    /// Open slice `slice` of `slices` of the queue at `path`
    ///
    /// # Errors
    /// If the directory cannot be created, `path` is not a directory, or the
    /// slice is out of range
    pub fn sliced(path: impl Into<PathBuf>, slice: u32, slices: u32) -> Result<Self> {
        if slices == 0 || slice >= slices {
            return Err(SpoolError::InvalidSlice { slice, slices });
        }

        let path = path.into();
        if !path.try_exists()? {
            internal!("{} does not exist, creating...", path.display());
            std::fs::create_dir_all(&path)?;
        } else if !path.is_dir() {
            return Err(SpoolError::NotADirectory(path));
        }

        Ok(Self {
            path,
            slice,
            slices,
            generator: Mutex::new(ulid::Generator::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The queue's directory name, used to tag log events
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |name| name.to_string_lossy().into_owned())
    }

    pub const fn slice(&self) -> (u32, u32) {
        (self.slice, self.slices)
    }

    fn next_token(&self) -> QueueToken {
        self.generator
            .lock()
            .generate()
            .map_or_else(|_| QueueToken::generate(), QueueToken::new)
    }

    fn file(&self, token: &QueueToken, ext: &str) -> PathBuf {
        self.path.join(format!("{token}.{ext}"))
    }

    fn suffixed(&self, token: &QueueToken, ext: &str, suffix: &str) -> PathBuf {
        self.path.join(format!("{token}.{ext}{suffix}"))
    }

    fn owns(&self, token: &QueueToken) -> bool {
        token.slice(self.slices) == self.slice
    }

    /// Persist an entry under a fresh token
    ///
    /// # Errors
    /// If the metadata cannot be encoded or either file cannot be written
    #[tracing::instrument(level = "debug", skip_all, fields(queue = %self.name()), err)]
    pub async fn enqueue(&self, message: &Message, metadata: &Metadata) -> Result<QueueToken> {
        let token = self.next_token();

        let encoded = serde_json::to_vec_pretty(metadata).map_err(SerializationError::Encode)?;

        let temp_message = self.path.join(format!("{TEMP_PREFIX}{token}.{MESSAGE_EXT}"));
        let temp_metadata = self.path.join(format!("{TEMP_PREFIX}{token}.{METADATA_EXT}"));

        if let Err(err) = write_both(&temp_message, &message.to_bytes(), &temp_metadata, &encoded).await
        {
            let _ = fs::remove_file(&temp_message).await;
            let _ = fs::remove_file(&temp_metadata).await;
            return Err(err.into());
        }

        fs::rename(&temp_message, self.file(&token, MESSAGE_EXT)).await?;
        fs::rename(&temp_metadata, self.file(&token, METADATA_EXT)).await?;

        queued!("Enqueued {token} on {}", self.name());

        Ok(token)
    }

    /// Committed tokens in this runner's slice, oldest first
    ///
    /// # Errors
    /// If the directory cannot be read
    pub async fn files(&self) -> Result<Vec<QueueToken>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut tokens = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let Some(filename) = filename.to_str() else {
                continue;
            };

            if !filename.ends_with(METADATA_EXT) {
                continue;
            }

            if let Some(token) = QueueToken::from_filename(filename)
                && self.owns(&token)
            {
                tokens.push(token);
            }
        }

        tokens.sort_unstable();
        Ok(tokens)
    }

    /// Read an entry and move it aside as a backup until [`Self::finish`]
    ///
    /// Returns `Ok(None)` when either half is missing; the half that is left
    /// is logged and removed, never handed to a runner on its own. An entry
    /// whose halves cannot be decoded is renamed with a `.bad` suffix so it
    /// can be inspected, and reported as an error.
    ///
    /// # Errors
    /// If the files cannot be read or renamed, or the entry cannot be decoded
    #[tracing::instrument(level = "debug", skip(self), fields(queue = %self.name()))]
    pub async fn dequeue(&self, token: &QueueToken) -> Result<Option<(Message, Metadata)>> {
        let message_path = self.file(token, MESSAGE_EXT);
        let metadata_path = self.file(token, METADATA_EXT);

        let Some(raw_metadata) = read_optional(&metadata_path).await? else {
            if remove_optional(&message_path).await? {
                error!(%token, queue = %self.name(), "Discarding message file with no metadata");
            } else {
                warn!(%token, queue = %self.name(), "Queue entry vanished before dequeue");
            }
            return Ok(None);
        };

        let Some(raw_message) = read_optional(&message_path).await? else {
            error!(%token, queue = %self.name(), "Discarding metadata file with no message");
            remove_optional(&metadata_path).await?;
            return Ok(None);
        };

        let decoded = serde_json::from_slice::<Metadata>(&raw_metadata)
            .map_err(|source| {
                SpoolError::from(SerializationError::Decode {
                    token: *token,
                    source,
                })
            })
            .and_then(|metadata| {
                Message::parse(&raw_message)
                    .map(|message| (message, metadata))
                    .map_err(|source| SpoolError::Message {
                        token: *token,
                        source,
                    })
            });

        let (message, metadata) = match decoded {
            Ok(entry) => entry,
            Err(err) => {
                error!(%token, queue = %self.name(), "Preserving undecodable entry: {err}");
                fs::rename(&message_path, self.suffixed(token, MESSAGE_EXT, BAD_SUFFIX)).await?;
                fs::rename(&metadata_path, self.suffixed(token, METADATA_EXT, BAD_SUFFIX)).await?;
                return Err(err);
            }
        };

        fs::rename(&metadata_path, self.suffixed(token, METADATA_EXT, BACKUP_SUFFIX)).await?;
        fs::rename(&message_path, self.suffixed(token, MESSAGE_EXT, BACKUP_SUFFIX)).await?;

        queued!(level = TRACE, "Dequeued {token} from {}", self.name());

        Ok(Some((message, metadata)))
    }

    /// Drop the backup of a dequeued entry once it has been disposed of
    ///
    /// # Errors
    /// If a backup file exists but cannot be removed
    pub async fn finish(&self, token: &QueueToken) -> Result<()> {
        remove_optional(&self.suffixed(token, METADATA_EXT, BACKUP_SUFFIX)).await?;
        remove_optional(&self.suffixed(token, MESSAGE_EXT, BACKUP_SUFFIX)).await?;
        Ok(())
    }

    /// Move the backups of entries that were mid-dispatch when a previous
    /// process died back into the queue. Returns how many were restored.
    ///
    /// Only this runner's slice is touched.
    ///
    /// # Errors
    /// If the directory cannot be read or a backup cannot be renamed
    pub async fn recover_backups(&self) -> Result<usize> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut tokens = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let Some(stem) = filename
                .to_str()
                .and_then(|name| name.strip_suffix(BACKUP_SUFFIX))
            else {
                continue;
            };

            if let Some(token) = QueueToken::from_filename(stem)
                && self.owns(&token)
                && !tokens.contains(&token)
            {
                tokens.push(token);
            }
        }

        for token in &tokens {
            for ext in [MESSAGE_EXT, METADATA_EXT] {
                let backup = self.suffixed(token, ext, BACKUP_SUFFIX);
                match fs::rename(&backup, self.file(token, ext)).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if !tokens.is_empty() {
            internal!(
                level = INFO,
                "Recovered {} backed up entries in {}",
                tokens.len(),
                self.name()
            );
        }

        Ok(tokens.len())
    }

    /// Remove message files that never got a metadata file, and stale
    /// temporary files, once they are older than `grace`. Returns how many
    /// files were removed.
    ///
    /// # Errors
    /// If the directory cannot be read or a file cannot be removed
    pub async fn reap_orphans(&self, grace: Duration) -> Result<usize> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut reaped = 0;

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let Some(filename) = filename.to_str() else {
                continue;
            };

            let orphan = if let Some(temp) = filename.strip_prefix(TEMP_PREFIX) {
                QueueToken::from_filename(temp).is_some_and(|token| self.owns(&token))
            } else if filename.ends_with(MESSAGE_EXT) {
                QueueToken::from_filename(filename).is_some_and(|token| {
                    self.owns(&token) && !self.file(&token, METADATA_EXT).exists()
                })
            } else {
                false
            };

            if !orphan {
                continue;
            }

            let age = entry
                .metadata()
                .await?
                .modified()?
                .elapsed()
                .unwrap_or_default();
            if age < grace {
                continue;
            }

            error!(queue = %self.name(), file = filename, "Removing orphaned queue file");
            if remove_optional(&entry.path()).await? {
                reaped += 1;
            }
        }

        Ok(reaped)
    }
}

async fn write_both(
    message_path: &Path,
    message: &[u8],
    metadata_path: &Path,
    metadata: &[u8],
) -> std::io::Result<()> {
    fs::write(message_path, message).await?;
    fs::write(metadata_path, metadata).await
}

async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn remove_optional(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
