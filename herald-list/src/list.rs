use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use herald_common::{Message, internal};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    bounce::{BounceOutcome, BounceRegistry},
    config::ListConfig,
    error::{ListError, Result},
    lock::ListLock,
    membership::Membership,
};

pub(crate) const STATE_FILE: &str = "config.json";
const LOCK_FILE: &str = "lock";

/// Everything persisted for one list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ListState {
    pub config: ListConfig,
    #[serde(default)]
    pub members: Membership,
    #[serde(default)]
    pub bounces: BounceRegistry,
}

/// A handle on one mailing list
///
/// The handle is composed of the list's settings, its members and its bounce
/// history. It can be read without the lock, but the state is only
/// guaranteed current while the lock is held: [`MailList::lock`] reloads it
/// from disk, and [`MailList::save`] refuses to write without the lock.
#[derive(Debug)]
pub struct MailList {
    dir: PathBuf,
    state: ListState,
    lock: Option<ListLock>,
    lock_lifetime: Duration,
}

impl MailList {
    pub(crate) const fn new(dir: PathBuf, state: ListState, lock_lifetime: Duration) -> Self {
        Self {
            dir,
            state,
            lock: None,
            lock_lifetime,
        }
    }

    pub(crate) async fn load(dir: &Path, name: &str) -> Result<ListState> {
        let raw = match tokio::fs::read(dir.join(STATE_FILE)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ListError::UnknownList(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice(&raw).map_err(|source| ListError::Corrupt {
            list: name.to_string(),
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.state.config.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the list lock, waiting at most `timeout`, and reload the list's
    /// state from disk. Locking an already locked handle does nothing.
    ///
    /// # Errors
    /// A lock timeout, or a failure reading the reloaded state
    pub async fn lock(&mut self, timeout: Duration) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }

        let lock = ListLock::acquire(
            &self.dir.join(LOCK_FILE),
            &self.state.config.name,
            timeout,
            self.lock_lifetime,
        )
        .await?;

        match Self::load(&self.dir, &self.state.config.name).await {
            Ok(state) => {
                self.state = state;
                self.lock = Some(lock);
                Ok(())
            }
            Err(err) => {
                lock.release().await?;
                Err(err)
            }
        }
    }

    /// Release the list lock, if held
    ///
    /// # Errors
    /// If the lock file cannot be removed
    pub async fn unlock(&mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            lock.release().await?;
            internal!("Unlocked {}", self.state.config.name);
        }
        Ok(())
    }

    pub const fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    fn ensure_locked(&self) -> Result<()> {
        if self.is_locked() {
            Ok(())
        } else {
            Err(ListError::NotLocked(self.state.config.name.clone()))
        }
    }

    /// Persist the list's state, restarting the lock's lifetime
    ///
    /// # Errors
    /// If the lock is not held or was lost, or the state cannot be written
    pub async fn save(&self) -> Result<()> {
        self.ensure_locked()?;
        if let Some(lock) = &self.lock {
            lock.refresh().await?;
        }
        write_state(&self.dir, &self.state).await
    }

    pub const fn config(&self) -> &ListConfig {
        &self.state.config
    }

    pub const fn config_mut(&mut self) -> &mut ListConfig {
        &mut self.state.config
    }

    pub const fn membership(&self) -> &Membership {
        &self.state.members
    }

    pub const fn membership_mut(&mut self) -> &mut Membership {
        &mut self.state.members
    }

    pub const fn bounces(&self) -> &BounceRegistry {
        &self.state.bounces
    }

    pub fn is_member(&self, address: &str) -> bool {
        self.state.members.is_member(address)
    }

    /// The language to use for `address`: the member's own choice, or the
    /// list's preferred language for non-members
    pub fn member_language(&self, address: Option<&str>) -> &str {
        address
            .and_then(|address| self.state.members.language(address))
            .unwrap_or(&self.state.config.preferred_language)
    }

    /// Register a bounce from `address` caused by `message`
    ///
    /// Returns `false` when `address` is not a member. Delivery to the member
    /// is disabled once its score reaches the list's threshold.
    ///
    /// # Errors
    /// If the lock is not held
    pub fn register_bounce(&mut self, address: &str, message: &Message) -> Result<bool> {
        self.ensure_locked()?;

        if !self.is_member(address) {
            return Ok(false);
        }

        let config = &self.state.config;
        let stale_after = i64::try_from(config.bounce_info_stale_after_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        let outcome = self.state.bounces.record(
            address,
            message.get("message-id"),
            Utc::now(),
            stale_after,
            config.bounce_score_threshold,
        );

        info!(list = %config.name, address, ?outcome, "Registered bounce");

        if outcome == BounceOutcome::ThresholdReached
            && let Some(member) = self.state.members.get_mut(address)
        {
            member.delivery_enabled = false;
            info!(list = %self.state.config.name, address, "Disabled delivery after too many bounces");
        }

        Ok(true)
    }

    pub fn owner(&self) -> &[String] {
        &self.state.config.owner
    }

    pub fn moderator(&self) -> &[String] {
        &self.state.config.moderator
    }

    pub const fn bounce_processing(&self) -> bool {
        self.state.config.bounce_processing
    }

    pub fn posting_address(&self) -> String {
        self.state.config.posting_address()
    }

    pub fn bounces_address(&self) -> String {
        self.state.config.extended_address("bounces")
    }

    pub fn owner_address(&self) -> String {
        self.state.config.extended_address("owner")
    }
}

pub(crate) async fn write_state(dir: &Path, state: &ListState) -> Result<()> {
    let encoded = serde_json::to_vec_pretty(state).map_err(|source| ListError::Corrupt {
        list: state.config.name.clone(),
        source,
    })?;

    let temp = dir.join(format!(".tmp_{STATE_FILE}"));
    tokio::fs::write(&temp, encoded).await?;
    tokio::fs::rename(&temp, dir.join(STATE_FILE)).await?;

    Ok(())
}
