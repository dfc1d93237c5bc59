//! Ordered handler stages applied to an incoming posting.
//!
//! Stages are named, looked up in a [`HandlerRegistry`] and consumed from the
//! front of the entry's pipeline. A stage that fails leaves itself at the
//! front of the remaining stages, which are stored in the entry's metadata so
//! the next attempt resumes exactly where this one stopped.

mod stages;

use std::{collections::VecDeque, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use herald_common::{Message, Metadata, internal};
use herald_list::MailList;
use herald_spool::{QueueConfig, SpoolError, queues};
use tracing::{error, info};

pub use stages::{
    CalculateRecipients, CookHeaders, LoopDetect, Moderate, ToArchive, ToDigest, ToOutgoing,
};

use crate::{error::RunnerError, runner::Disposition};

/// What a stage decided about the message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the message to the next stage
    Continue,
    /// Drop the message; later stages do not run
    Discard,
    /// The message is held for approval; later stages do not run
    Hold { reason: String },
}

/// Everything a stage may read or change
pub struct StageContext<'a> {
    pub list: &'a mut MailList,
    pub message: &'a mut Message,
    pub metadata: &'a mut Metadata,
}

/// One named pipeline stage
///
/// Returning an error means the stage could not do its job this time. The
/// message is requeued and the stage retried, so a stage must be safe to run
/// again on the same message.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<Verdict>;
}

/// The stages a pipeline may name
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: AHashMap<&'static str, Arc<dyn Handler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

/// The stages run for a list that does not name its own
pub fn default_pipeline() -> Vec<String> {
    [
        "LoopDetect",
        "Moderate",
        "CookHeaders",
        "CalculateRecipients",
        "ToDigest",
        "ToArchive",
        "ToOutgoing",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in stage, with the queues it copies messages to opened
    /// under `queue_config`
    ///
    /// # Errors
    /// If one of the queue directories cannot be opened
    pub fn builtin(queue_config: &QueueConfig) -> Result<Self, SpoolError> {
        let hold = Arc::new(queue_config.open(queues::HOLD)?);
        let digest = Arc::new(queue_config.open(queues::DIGEST)?);
        let archive = Arc::new(queue_config.open(queues::ARCHIVE)?);
        let out = Arc::new(queue_config.open(queues::OUT)?);

        let mut registry = Self::new();
        registry
            .register(LoopDetect)
            .register(Moderate::new(hold))
            .register(CookHeaders)
            .register(CalculateRecipients)
            .register(ToDigest::new(digest))
            .register(ToArchive::new(archive))
            .register(ToOutgoing::new(out));

        Ok(registry)
    }

    /// Add `handler`, replacing any stage of the same name
    pub fn register(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.insert(handler.name(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// The stages still to run for this entry: those left by a previous
    /// attempt, else the list's own pipeline, else `default`
    pub fn resolve(metadata: &Metadata, list: &MailList, default: &[String]) -> VecDeque<String> {
        metadata
            .pipeline()
            .or_else(|| list.config().pipeline.clone().map(VecDeque::from))
            .unwrap_or_else(|| default.iter().cloned().collect())
    }

    /// Run `stages` in order against the entry in `ctx`
    ///
    /// # Errors
    /// [`RunnerError::UnknownStage`] when a stage is not registered. No stage
    /// runs in that case.
    pub async fn run(
        &self,
        mut stages: VecDeque<String>,
        ctx: &mut StageContext<'_>,
    ) -> Result<Disposition, RunnerError> {
        if let Some(unknown) = stages.iter().find(|name| !self.contains(name)) {
            return Err(RunnerError::UnknownStage(unknown.clone()));
        }

        while let Some(name) = stages.pop_front() {
            let handler = self
                .get(&name)
                .ok_or_else(|| RunnerError::UnknownStage(name.clone()))?;

            let pid = std::process::id();
            let result = handler.process(ctx).await;
            watchdog(pid, &name);

            match result {
                Ok(Verdict::Continue) => internal!("Stage {name} done"),
                Ok(Verdict::Discard) => {
                    info!(list = %ctx.list.name(), stage = %name, "Message discarded");
                    return Ok(Disposition::Done);
                }
                Ok(Verdict::Hold { reason }) => {
                    info!(list = %ctx.list.name(), stage = %name, reason, "Message held");
                    return Ok(Disposition::Done);
                }
                Err(err) => {
                    error!(
                        list = %ctx.list.name(),
                        stage = %name,
                        "Stage failed, message will be retried: {err:#}"
                    );
                    stages.push_front(name);
                    ctx.metadata.set_pipeline(&stages);
                    return Ok(Disposition::Requeue);
                }
            }
        }

        Ok(Disposition::Done)
    }
}

/// A stage must never leave a forked copy of the runner behind. If the
/// process id changed while it ran, this is that copy.
fn watchdog(pid: u32, stage: &str) {
    let now = std::process::id();
    if now != pid {
        error!(stage, pid, now, "Process id changed while a stage ran, exiting");
        std::process::exit(1);
    }
}
