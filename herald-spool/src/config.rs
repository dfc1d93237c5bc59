use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::{Result, Switchboard};

/// Names of the queue directories under [`QueueConfig::root`]
pub mod queues {
    pub const IN: &str = "in";
    pub const OUT: &str = "out";
    pub const BOUNCES: &str = "bounces";
    pub const ARCHIVE: &str = "archive";
    pub const DIGEST: &str = "digest";
    pub const HOLD: &str = "hold";
    pub const SHUNT: &str = "shunt";

    pub const ALL: [&str; 7] = [IN, OUT, BOUNCES, ARCHIVE, DIGEST, HOLD, SHUNT];
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/spool/herald/qfiles")
}

/// Where the queue directories live
///
/// ```ron
/// queue: (
///     root: "/var/spool/herald/qfiles",
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_root", deserialize_with = "validated_root")]
    pub root: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

fn validated_root<'de, D>(deserializer: D) -> std::result::Result<PathBuf, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let root = PathBuf::deserialize(deserializer)?;
    if root.components().any(|c| c == Component::ParentDir) {
        return Err(serde::de::Error::custom(format!(
            "Queue root cannot contain '..' components: {}",
            root.display()
        )));
    }
    Ok(root)
}

impl QueueConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn path(&self, queue: &str) -> PathBuf {
        self.root.join(queue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the whole of a named queue
    ///
    /// # Errors
    /// If the queue directory cannot be created
    pub fn open(&self, queue: &str) -> Result<Switchboard> {
        Switchboard::new(self.path(queue))
    }

    /// Open one hash slice of a named queue
    ///
    /// # Errors
    /// If the queue directory cannot be created, or the slice is out of range
    pub fn open_sliced(&self, queue: &str, slice: u32, slices: u32) -> Result<Switchboard> {
        Switchboard::sliced(self.path(queue), slice, slices)
    }
}
