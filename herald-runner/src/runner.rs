//! The loop every queue runner shares.
//!
//! A [`Runner`] scans its slice of one queue, hands each entry to its
//! [`Dispatcher`] and acts on the returned [`Disposition`]. Anything the
//! dispatcher could not cope with, an error or a panic, moves the entry as
//! it was before dispatch to the shunt queue.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures_util::FutureExt;
use herald_common::{Message, Metadata, Signal, Translation, internal, queued};
use herald_list::MailList;
use herald_spool::{QueueToken, Switchboard};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{error, info, warn};

use crate::{cache::ListCache, children::Children, config::RunnerConfig, error::RunnerError};

/// What happens to an entry after a successful dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Put the (possibly modified) entry back in the queue under a new token
    Requeue,
    /// The entry is finished with
    Done,
}

/// The part of a runner that differs between queues
#[async_trait]
pub trait Dispatcher: Send {
    /// Used to tag log events
    fn name(&self) -> &'static str;

    /// Handle one entry for `list`
    ///
    /// # Errors
    /// Any error is unexpected: the runner logs it and shunts the entry
    async fn dispose(
        &mut self,
        list: &mut MailList,
        message: &mut Message,
        metadata: &mut Metadata,
        children: &mut Children,
    ) -> anyhow::Result<Disposition>;

    /// Called once per pass over the queue, including passes that found
    /// nothing to do
    async fn periodic(&mut self, _lists: &mut ListCache) {}

    /// Called once when the runner stops
    async fn cleanup(&mut self, _lists: &mut ListCache) {}
}

pub struct Runner<D: Dispatcher> {
    dispatcher: D,
    switchboard: Arc<Switchboard>,
    shunt: Arc<Switchboard>,
    lists: ListCache,
    children: Children,
    translation: Translation,
    config: RunnerConfig,
}

enum Outcome {
    Dispatched(Disposition),
    Failed(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(ToString::to_string))
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// `true` once the runner has been asked to stop
fn stop_requested(shutdown: &mut broadcast::Receiver<Signal>) -> bool {
    loop {
        match shutdown.try_recv() {
            Ok(Signal::Shutdown) | Err(TryRecvError::Closed | TryRecvError::Lagged(_)) => {
                return true;
            }
            Ok(Signal::Finalised) => {}
            Err(TryRecvError::Empty) => return false,
        }
    }
}

impl<D: Dispatcher> Runner<D> {
    pub fn new(
        dispatcher: D,
        switchboard: Arc<Switchboard>,
        shunt: Arc<Switchboard>,
        lists: ListCache,
        config: RunnerConfig,
    ) -> Self {
        Self {
            dispatcher,
            switchboard,
            shunt,
            lists,
            children: Children::new(),
            translation: Translation::default(),
            config,
        }
    }

    pub const fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub const fn lists(&self) -> &ListCache {
        &self.lists
    }

    pub const fn children(&self) -> &Children {
        &self.children
    }

    pub const fn translation(&self) -> &Translation {
        &self.translation
    }

    /// Put back entries a previous run was dispatching when it died, and
    /// remove half-written ones
    ///
    /// # Errors
    /// If the queue directory cannot be read
    pub async fn prepare(&self) -> Result<(), RunnerError> {
        let recovered = self.switchboard.recover_backups().await?;
        let reaped = self
            .switchboard
            .reap_orphans(self.config.orphan_grace())
            .await?;

        if recovered > 0 || reaped > 0 {
            info!(
                runner = self.dispatcher.name(),
                recovered, reaped, "Repaired queue after an unclean stop"
            );
        }

        Ok(())
    }

    /// Run until a [`Signal::Shutdown`] arrives or the channel closes
    ///
    /// # Errors
    /// If the queue cannot be prepared at start up
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), RunnerError> {
        self.prepare().await?;

        internal!(
            level = INFO,
            "{} runner started on {}",
            self.dispatcher.name(),
            self.switchboard.path().display()
        );

        loop {
            let handled = match self.scan(Some(&mut shutdown)).await {
                Ok(handled) => handled,
                Err(err) => {
                    error!(runner = self.dispatcher.name(), "Unable to scan queue: {err}");
                    0
                }
            };
            self.dispatcher.periodic(&mut self.lists).await;

            if stop_requested(&mut shutdown) {
                break;
            }

            if handled == 0 {
                tokio::select! {
                    () = tokio::time::sleep(self.config.sleep()) => {}
                    sig = shutdown.recv() => {
                        match sig {
                            Ok(Signal::Finalised) => {}
                            Ok(Signal::Shutdown) | Err(_) => break,
                        }
                    }
                }
            }
        }

        internal!(level = INFO, "{} runner stopping", self.dispatcher.name());
        self.cleanup().await;

        Ok(())
    }

    /// Perform a single scan of the queue, then the dispatcher's periodic
    /// work
    ///
    /// Returns the number of entries handled
    ///
    /// # Errors
    /// If the queue directory cannot be listed
    pub async fn run_once(&mut self) -> Result<usize, RunnerError> {
        let handled = self.scan(None).await;
        self.dispatcher.periodic(&mut self.lists).await;
        handled
    }

    /// Release everything the runner holds
    pub async fn cleanup(&mut self) {
        self.children.reap_all(self.config.reap_timeout()).await;
        self.dispatcher.cleanup(&mut self.lists).await;
        self.lists.clear();
    }

    async fn scan(
        &mut self,
        mut shutdown: Option<&mut broadcast::Receiver<Signal>>,
    ) -> Result<usize, RunnerError> {
        let tokens = self.switchboard.files().await?;
        internal!("Found {} entries in {}", tokens.len(), self.switchboard.name());

        let mut handled = 0;
        for token in tokens {
            if let Some(shutdown) = shutdown.as_deref_mut()
                && stop_requested(shutdown)
            {
                internal!(level = INFO, "Stop requested, ending scan early");
                break;
            }

            self.handle(&token).await;
            self.children.reap();
            handled += 1;
        }

        Ok(handled)
    }

    async fn handle(&mut self, token: &QueueToken) {
        let (mut message, mut metadata) = match self.switchboard.dequeue(token).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(err) => {
                error!(%token, "Unable to dequeue entry: {err}");
                return;
            }
        };

        let snapshot = (message.clone(), metadata.clone());

        let Some(listname) = metadata.listname().map(ToString::to_string) else {
            error!(%token, "Entry has no listname");
            self.shunt(token, &snapshot.0, &snapshot.1).await;
            self.finish(token).await;
            return;
        };

        let outcome = self
            .dispatch(token, &listname, &mut message, &mut metadata)
            .await;

        match outcome {
            Some(Outcome::Dispatched(Disposition::Done)) => {
                queued!("Finished {token} for {listname}");
            }
            Some(Outcome::Dispatched(Disposition::Requeue)) => {
                match self.switchboard.enqueue(&message, &metadata).await {
                    Ok(requeued) => queued!("Requeued {token} as {requeued}"),
                    Err(err) => {
                        // Leave the backup in place; it is restored on the next start
                        error!(%token, "Unable to requeue entry: {err}");
                        return;
                    }
                }
            }
            Some(Outcome::Failed(reason)) => {
                error!(
                    runner = self.dispatcher.name(),
                    %token,
                    list = %listname,
                    "Uncaught error dispatching entry: {reason}"
                );
                self.shunt(token, &snapshot.0, &snapshot.1).await;
                self.lists.evict(&listname);
            }
            None => {
                self.shunt(token, &snapshot.0, &snapshot.1).await;
            }
        }

        self.finish(token).await;
    }

    /// Returns `None` when the list could not be opened
    async fn dispatch(
        &mut self,
        token: &QueueToken,
        listname: &str,
        message: &mut Message,
        metadata: &mut Metadata,
    ) -> Option<Outcome> {
        let list = match self.lists.open(listname).await {
            Ok(list) => list,
            Err(err) => {
                error!(%token, list = %listname, "Unable to open list: {err}");
                return None;
            }
        };

        let sender = message.sender();
        let language = list.member_language(sender.as_deref()).to_string();
        metadata.set_lang(&language);
        let _language = self.translation.scoped(&language);

        let result = AssertUnwindSafe(self.dispatcher.dispose(
            list,
            message,
            metadata,
            &mut self.children,
        ))
        .catch_unwind()
        .await;

        if list.is_locked() {
            warn!(list = %listname, "List still locked after dispatch, unlocking");
            if let Err(err) = list.unlock().await {
                error!(list = %listname, "Unable to unlock list: {err}");
            }
        }

        Some(match result {
            Ok(Ok(disposition)) => Outcome::Dispatched(disposition),
            Ok(Err(err)) => Outcome::Failed(format!("{err:#}")),
            Err(panic) => Outcome::Failed(format!("panic: {}", panic_message(panic.as_ref()))),
        })
    }

    async fn shunt(&self, token: &QueueToken, message: &Message, metadata: &Metadata) {
        match self.shunt.enqueue(message, metadata).await {
            Ok(shunted) => queued!(level = WARN, "Shunted {token} as {shunted}"),
            Err(err) => error!(%token, "Unable to shunt entry: {err}"),
        }
    }

    async fn finish(&self, token: &QueueToken) {
        if let Err(err) = self.switchboard.finish(token).await {
            warn!(%token, "Unable to remove dequeued entry: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let owned: Box<dyn Any + Send> = Box::new("owned".to_string());
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_stop_requested() {
        let (tx, mut rx) = broadcast::channel(4);
        assert!(!stop_requested(&mut rx));

        tx.send(Signal::Finalised).expect("send");
        assert!(!stop_requested(&mut rx));

        tx.send(Signal::Shutdown).expect("send");
        assert!(stop_requested(&mut rx));

        drop(tx);
        assert!(stop_requested(&mut rx));
    }
}
