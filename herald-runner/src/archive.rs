use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{Message, Metadata, internal};
use herald_list::MailList;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::{
    children::Children,
    outgoing::now,
    runner::{Dispatcher, Disposition},
};

/// When the archived copy's `Date:` is replaced by the time it was received
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClobberPolicy {
    Never,
    Always,
    /// Only when the date is unparseable or too far from now
    #[default]
    WhenInsane,
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("/var/lib/herald/archives")
}

const fn default_allowable_sane_date_skew_secs() -> u64 {
    15 * 24 * 60 * 60
}

/// The `archive` section of the configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub clobber_date: ClobberPolicy,

    #[serde(default = "default_allowable_sane_date_skew_secs")]
    pub allowable_sane_date_skew_secs: u64,

    /// Where [`MboxArchiver`] writes
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            clobber_date: ClobberPolicy::default(),
            allowable_sane_date_skew_secs: default_allowable_sane_date_skew_secs(),
            archive_root: default_archive_root(),
        }
    }
}

impl ArchiveConfig {
    pub const fn allowable_sane_date_skew(&self) -> Duration {
        Duration::from_secs(self.allowable_sane_date_skew_secs)
    }
}

/// Somewhere postings are kept
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(&self, list: &MailList, message: &Message) -> anyhow::Result<()>;
}

/// Appends postings to one mbox file per list
#[derive(Debug, Clone)]
pub struct MboxArchiver {
    root: PathBuf,
}

impl MboxArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, list: &str) -> PathBuf {
        self.root.join(format!("{list}.mbox"))
    }
}

fn mbox_entry(message: &Message, received: DateTime<Utc>) -> Vec<u8> {
    let sender = message
        .sender()
        .unwrap_or_else(|| "MAILER-DAEMON".to_string());

    let mut entry = format!("From {sender} {}\n", received.format("%a %b %e %H:%M:%S %Y")).into_bytes();

    let raw = message.to_bytes();
    for line in raw.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b"From ") {
            entry.push(b'>');
        }
        entry.extend_from_slice(line);
    }

    if !entry.ends_with(b"\n") {
        entry.push(b'\n');
    }
    entry.push(b'\n');

    entry
}

#[async_trait]
impl Archiver for MboxArchiver {
    async fn archive(&self, list: &MailList, message: &Message) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Unable to create {}", self.root.display()))?;

        let path = self.path(list.name());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Unable to open {}", path.display()))?;

        file.write_all(&mbox_entry(message, Utc::now())).await?;
        file.flush().await?;

        internal!("Archived message to {}", path.display());
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn timestamp(secs: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs.trunc() as i64, 0).unwrap_or_else(Utc::now)
}

/// Archives postings from the `archive` queue
pub struct ArchRunner<A: Archiver> {
    archiver: A,
    config: ArchiveConfig,
    lock_timeout: Duration,
}

impl<A: Archiver> ArchRunner<A> {
    pub const fn new(archiver: A, config: ArchiveConfig, lock_timeout: Duration) -> Self {
        Self {
            archiver,
            config,
            lock_timeout,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn should_clobber(&self, date: Option<&str>, now: f64) -> bool {
        let Some(date) = date else {
            return true;
        };

        match self.config.clobber_date {
            ClobberPolicy::Never => false,
            ClobberPolicy::Always => true,
            ClobberPolicy::WhenInsane => mailparse::dateparse(date).map_or(true, |sent| {
                (now - sent as f64).abs() > self.config.allowable_sane_date_skew().as_secs_f64()
            }),
        }
    }

    /// Replace `Date:` with the time the message was received, keeping the
    /// original in `X-Original-Date:`
    fn clobber_date(&self, message: &mut Message, metadata: &Metadata) {
        let now = now();
        let original = message.get("date").map(str::to_string);

        if !self.should_clobber(original.as_deref(), now) {
            return;
        }

        let received = timestamp(metadata.received_time().unwrap_or(now));
        debug!(original = ?original, "Replacing Date header");

        message.remove("date");
        message.remove("x-original-date");
        message.append("Date", received.to_rfc2822());
        if let Some(original) = original {
            message.append("X-Original-Date", original);
        }
    }
}

#[async_trait]
impl<A: Archiver> Dispatcher for ArchRunner<A> {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn dispose(
        &mut self,
        list: &mut MailList,
        message: &mut Message,
        metadata: &mut Metadata,
        _children: &mut Children,
    ) -> anyhow::Result<Disposition> {
        match list.lock(self.lock_timeout).await {
            Ok(()) => {}
            Err(err) if err.is_lock_timeout() => {
                debug!(list = %list.name(), "List lock timed out, will retry");
                return Ok(Disposition::Requeue);
            }
            Err(err) => return Err(err.into()),
        }

        self.clobber_date(message, metadata);
        let archived = self.archiver.archive(list, message).await;

        let saved = list.save().await;
        if let Err(err) = list.unlock().await {
            error!(list = %list.name(), "Unable to unlock list: {err}");
        }

        archived?;
        saved?;

        Ok(Disposition::Done)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct Discard;

    #[async_trait]
    impl Archiver for Discard {
        async fn archive(&self, _list: &MailList, _message: &Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn runner(clobber_date: ClobberPolicy) -> ArchRunner<Discard> {
        ArchRunner::new(
            Discard,
            ArchiveConfig {
                clobber_date,
                ..ArchiveConfig::default()
            },
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_clobber_policies() {
        let date = "Mon, 1 Jan 2001 00:00:00 +0000";
        let then = 978_307_200.0;

        assert!(runner(ClobberPolicy::Never).should_clobber(None, then));
        assert!(!runner(ClobberPolicy::Never).should_clobber(Some(date), then));
        assert!(runner(ClobberPolicy::Always).should_clobber(Some(date), then));

        let sane = runner(ClobberPolicy::WhenInsane);
        assert!(!sane.should_clobber(Some(date), then + 60.0));
        assert!(sane.should_clobber(Some(date), then + 30.0 * 24.0 * 60.0 * 60.0));
        assert!(sane.should_clobber(Some("not a date"), then));
    }

    #[test]
    fn test_clobbered_date_keeps_original() {
        let mut message =
            Message::from_parts([("Date", "Mon, 1 Jan 2001 00:00:00 +0000")], "hi\n").expect("message");
        let mut metadata = Metadata::new();
        metadata.set_received_time(1_000_000_000.0);

        runner(ClobberPolicy::Always).clobber_date(&mut message, &metadata);

        let date = message.get("date").expect("date");
        assert_eq!(mailparse::dateparse(date), Ok(1_000_000_000));
        assert_eq!(
            message.get("x-original-date"),
            Some("Mon, 1 Jan 2001 00:00:00 +0000")
        );
    }

    #[test]
    fn test_mbox_entry_quotes_from_lines() {
        let message = Message::from_parts([("From", "a@example.com")], "From here\nok\n").expect("message");
        let entry = String::from_utf8(mbox_entry(&message, timestamp(1_000_000_000.0))).expect("utf8");

        assert!(entry.starts_with("From a@example.com Sun Sep  9 01:46:40 2001\n"));
        assert!(entry.contains("\n>From here\n"));
        assert!(entry.ends_with("ok\n\n"));
    }
}
