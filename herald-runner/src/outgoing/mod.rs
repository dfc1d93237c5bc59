//! Delivery of distributed postings, with bounded retry of temporary
//! failures and batched registration of permanent ones.

mod delivery;
mod retry;

use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use herald_common::{Message, Metadata};
use herald_list::{ListError, MailList};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

pub use delivery::SendmailDelivery;
pub use retry::{Retry, RetryPolicy, now};

use crate::{
    cache::ListCache,
    children::Children,
    runner::{Dispatcher, Disposition},
};

/// The result of handing a message to the delivery collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    SomeRecipientsFailed {
        /// Will never succeed; registered as bounces
        permanent: Vec<String>,
        /// Worth trying again
        temporary: Vec<String>,
    },
}

/// Something that can send a message to the recipients in its metadata
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(
        &self,
        list: &MailList,
        message: &Message,
        metadata: &Metadata,
        children: &mut Children,
    ) -> anyhow::Result<DeliveryOutcome>;
}

/// The `outgoing` section of the configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutgoingConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub sendmail: SendmailDelivery,
}

/// Delivers entries in the `out` queue
pub struct OutgoingRunner<T: Delivery> {
    delivery: T,
    retry: RetryPolicy,
    lock_timeout: Duration,
    /// Permanent failures waiting to be registered, by list name
    permanent_failures: AHashMap<String, Vec<(String, Message)>>,
}

impl<T: Delivery> OutgoingRunner<T> {
    pub fn new(delivery: T, retry: RetryPolicy, lock_timeout: Duration) -> Self {
        Self {
            delivery,
            retry,
            lock_timeout,
            permanent_failures: AHashMap::new(),
        }
    }

    pub const fn delivery(&self) -> &T {
        &self.delivery
    }

    /// Number of permanent failures not yet registered
    pub fn pending_bounces(&self) -> usize {
        self.permanent_failures.values().map(Vec::len).sum()
    }

    async fn register_pending(
        list: &mut MailList,
        pending: &[(String, Message)],
        lock_timeout: Duration,
    ) -> herald_list::Result<()> {
        list.lock(lock_timeout).await?;

        let mut result = Ok(());
        for (address, message) in pending {
            if let Err(err) = list.register_bounce(address, message) {
                result = Err(err);
                break;
            }
        }

        if result.is_ok() {
            result = list.save().await;
        }
        list.unlock().await?;

        result
    }
}

#[async_trait]
impl<T: Delivery> Dispatcher for OutgoingRunner<T> {
    fn name(&self) -> &'static str {
        "outgoing"
    }

    async fn dispose(
        &mut self,
        list: &mut MailList,
        message: &mut Message,
        metadata: &mut Metadata,
        children: &mut Children,
    ) -> anyhow::Result<Disposition> {
        let outcome = self
            .delivery
            .deliver(list, message, metadata, children)
            .await?;

        let DeliveryOutcome::SomeRecipientsFailed {
            permanent,
            temporary,
        } = outcome
        else {
            debug!(list = %list.name(), "Delivered");
            return Ok(Disposition::Done);
        };

        if !permanent.is_empty() {
            info!(list = %list.name(), count = permanent.len(), "Permanent delivery failures");
            self.permanent_failures
                .entry(list.name().to_string())
                .or_default()
                .extend(permanent.into_iter().map(|address| (address, message.clone())));
        }

        if temporary.is_empty() {
            return Ok(Disposition::Done);
        }

        match self.retry.decide(metadata, temporary.len(), now()) {
            Retry::GiveUp => {
                warn!(
                    list = %list.name(),
                    recipients = ?temporary,
                    "Giving up on delivery after the retry period"
                );
                Ok(Disposition::Done)
            }
            Retry::Requeue => {
                metadata.set_recips(temporary);
                Ok(Disposition::Requeue)
            }
        }
    }

    async fn periodic(&mut self, lists: &mut ListCache) {
        let names: Vec<String> = self.permanent_failures.keys().cloned().collect();

        for name in names {
            let list = match lists.open(&name).await {
                Ok(list) => list,
                Err(err) => {
                    error!(list = %name, "Dropping bounces for a list that cannot be opened: {err}");
                    self.permanent_failures.remove(&name);
                    continue;
                }
            };

            let Some(pending) = self.permanent_failures.get(&name) else {
                continue;
            };

            match Self::register_pending(list, pending, self.lock_timeout).await {
                Ok(()) => {
                    self.permanent_failures.remove(&name);
                }
                Err(err) if err.is_lock_timeout() => {
                    debug!(list = %name, "List busy, registering bounces later");
                    return;
                }
                Err(err @ ListError::UnknownList(_)) => {
                    error!(list = %name, "Dropping bounces: {err}");
                    self.permanent_failures.remove(&name);
                }
                Err(err) => {
                    error!(list = %name, "Unable to register bounces: {err}");
                }
            }
        }
    }

    async fn cleanup(&mut self, lists: &mut ListCache) {
        self.periodic(lists).await;

        let remaining = self.pending_bounces();
        if remaining > 0 {
            warn!(remaining, "Stopping with bounces that were not registered");
        }
    }
}
