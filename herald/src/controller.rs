use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use herald_common::{Message, Metadata, Signal, internal, logging};
use herald_list::ListStore;
use herald_runner::{
    ArchRunner, ArchiveConfig, BounceRunner, Dispatcher, HandlerRegistry, IncomingRunner,
    ListCache, MboxArchiver, OutgoingConfig, OutgoingRunner, Runner, RunnerConfig, SiteConfig,
    bounce::builtin_detectors, default_pipeline, outgoing::now,
};
use herald_spool::{QueueConfig, QueueToken, queues};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::info;

/// The runners `herald run` can start
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunnerKind {
    Incoming,
    Outgoing,
    Bounce,
    Archive,
}

impl RunnerKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Bounce => "bounce",
            Self::Archive => "archive",
        }
    }

    /// The queue this runner consumes
    pub const fn queue(self) -> &'static str {
        match self {
            Self::Incoming => queues::IN,
            Self::Outgoing => queues::OUT,
            Self::Bounce => queues::BOUNCES,
            Self::Archive => queues::ARCHIVE,
        }
    }
}

/// Which part of its queue a runner owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub slice: u32,
    pub slices: u32,
}

impl Default for Slice {
    fn default() -> Self {
        Self {
            slice: 0,
            slices: 1,
        }
    }
}

/// The whole of a herald installation's configuration
///
/// ```ron
/// (
///     queue: (root: "/var/spool/herald/qfiles"),
///     lists: (root: "/var/lib/herald/lists"),
///     runner: (sleep_secs: 1, lock_timeout_secs: 10),
///     site: (site_list: "mailman", host: "lists.example.com"),
///     pipeline: ["LoopDetect", "CookHeaders", "CalculateRecipients", "ToOutgoing"],
///     outgoing: (retry: (retry_period_secs: 432000)),
///     archive: (clobber_date: when_insane),
/// )
/// ```
#[derive(Debug, Deserialize)]
pub struct Herald {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub lists: ListStore,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub site: SiteConfig,

    /// Stages for lists that do not name their own
    #[serde(default = "default_pipeline")]
    pub pipeline: Vec<String>,

    #[serde(default)]
    pub outgoing: OutgoingConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,
}

impl Default for Herald {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            lists: ListStore::default(),
            runner: RunnerConfig::default(),
            site: SiteConfig::default(),
            pipeline: default_pipeline(),
            outgoing: OutgoingConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, finishing the current message");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, finishing the current message");
        }
    };

    SHUTDOWN_BROADCAST.send(Signal::Shutdown)?;

    // A second interrupt stops without waiting
    tokio::signal::ctrl_c().await?;
    anyhow::bail!("Interrupted again, stopping immediately")
}

/// Find the configuration file using the following precedence:
/// 1. `HERALD_CONFIG` environment variable
/// 2. ./herald.config.ron (current working directory)
/// 3. /etc/herald/herald.config.ron (system-wide config)
///
/// # Errors
/// If `HERALD_CONFIG` names a missing file, or no file is found at all
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("HERALD_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "HERALD_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./herald.config.ron"),
        PathBuf::from("/etc/herald/herald.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - HERALD_CONFIG environment variable\n{paths_tried}"
    )
}

impl Herald {
    /// Parse a configuration from RON
    ///
    /// # Errors
    /// If the text is not a valid configuration
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(content)?)
    }

    /// Read the configuration at `path`
    ///
    /// # Errors
    /// If the file cannot be read or is not a valid configuration
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;
        Self::from_ron(&content)
    }

    /// Run one queue runner until it is told to stop, or for a single pass
    /// over its queue when `once` is set
    ///
    /// # Errors
    /// If the runner's queues or collaborators cannot be set up
    pub async fn run(&self, kind: RunnerKind, slice: Slice, once: bool) -> anyhow::Result<()> {
        logging::init(kind.name());

        let lock_timeout = self.runner.lock_timeout();
        match kind {
            RunnerKind::Incoming => {
                let registry = HandlerRegistry::builtin(&self.queue)?;
                let dispatcher =
                    IncomingRunner::new(Arc::new(registry), self.pipeline.clone(), lock_timeout);
                self.serve(kind, slice, once, dispatcher).await
            }
            RunnerKind::Outgoing => {
                let dispatcher = OutgoingRunner::new(
                    self.outgoing.sendmail.clone(),
                    self.outgoing.retry.clone(),
                    lock_timeout,
                );
                self.serve(kind, slice, once, dispatcher).await
            }
            RunnerKind::Bounce => {
                let dispatcher = BounceRunner::new(
                    Arc::new(self.queue.open(queues::OUT)?),
                    self.lists.clone(),
                    self.site.clone(),
                    builtin_detectors()?,
                    lock_timeout,
                );
                self.serve(kind, slice, once, dispatcher).await
            }
            RunnerKind::Archive => {
                let dispatcher = ArchRunner::new(
                    MboxArchiver::new(&self.archive.archive_root),
                    self.archive.clone(),
                    lock_timeout,
                );
                self.serve(kind, slice, once, dispatcher).await
            }
        }
    }

    async fn serve<D: Dispatcher>(
        &self,
        kind: RunnerKind,
        slice: Slice,
        once: bool,
        dispatcher: D,
    ) -> anyhow::Result<()> {
        let switchboard = self
            .queue
            .open_sliced(kind.queue(), slice.slice, slice.slices)?;
        let shunt = self.queue.open(queues::SHUNT)?;

        let mut runner = Runner::new(
            dispatcher,
            Arc::new(switchboard),
            Arc::new(shunt),
            ListCache::new(self.lists.clone(), self.runner.cache_lists),
            self.runner.clone(),
        );

        if once {
            runner.prepare().await?;
            let handled = runner.run_once().await?;
            runner.cleanup().await;
            info!(runner = kind.name(), handled, "Single pass complete");
            return Ok(());
        }

        let ret = tokio::select! {
            r = runner.run(SHUTDOWN_BROADCAST.subscribe()) => r.map_err(Into::into),
            r = shutdown() => r,
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }

    /// Put a posting for `list` into the incoming queue
    ///
    /// # Errors
    /// If the list does not exist, the message cannot be parsed, or the queue
    /// cannot be written
    pub async fn inject(&self, list: &str, raw: &[u8]) -> anyhow::Result<QueueToken> {
        self.lists.open(list).await?;

        let message = Message::parse(raw)?;
        let mut metadata = Metadata::new();
        metadata.set_listname(list);
        metadata.set_received_time(now());

        let token = self.queue.open(queues::IN)?.enqueue(&message, &metadata).await?;
        info!(list, %token, "Injected message");

        Ok(token)
    }

    /// The entries waiting in `queue`
    ///
    /// # Errors
    /// If `queue` is not a known queue, or cannot be read
    pub async fn queued(&self, queue: &str) -> anyhow::Result<Vec<QueueToken>> {
        if !queues::ALL.contains(&queue) {
            anyhow::bail!("Unknown queue {queue}, expected one of {}", queues::ALL.join(", "));
        }

        Ok(self.queue.open(queue)?.files().await?)
    }
}
