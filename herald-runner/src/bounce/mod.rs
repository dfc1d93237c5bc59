//! Handling of mail returned to a list's `-bounces` address.

mod detect;
mod dsn;
mod postfix;
mod verp;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_common::{Message, Metadata, metadata::keys, queued};
use herald_list::{ListStore, MailList};
use herald_spool::Switchboard;
use tracing::{debug, info, warn};

pub use detect::{Bouncer, builtin as builtin_detectors};
pub use dsn::Dsn;
pub use postfix::Postfix;
pub use verp::Verp;

use crate::{
    children::Children,
    config::SiteConfig,
    runner::{Dispatcher, Disposition},
};

/// Registers bounces against list members, or forwards what it cannot
/// understand to a human
pub struct BounceRunner {
    out: Arc<Switchboard>,
    store: ListStore,
    site: SiteConfig,
    detectors: Vec<Box<dyn Bouncer>>,
    lock_timeout: Duration,
}

impl BounceRunner {
    pub fn new(
        out: Arc<Switchboard>,
        store: ListStore,
        site: SiteConfig,
        detectors: Vec<Box<dyn Bouncer>>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            out,
            store,
            site,
            detectors,
            lock_timeout,
        }
    }

    async fn forward(
        &self,
        message: &Message,
        metadata: &Metadata,
        recips: Vec<String>,
        envsender: &str,
    ) -> anyhow::Result<()> {
        let mut forwarded = metadata.clone();
        forwarded.remove(keys::PIPELINE);
        forwarded.set_recips(recips);
        forwarded.set_envsender(envsender);

        let token = self.out.enqueue(message, &forwarded).await?;
        queued!("Forwarded bounce as {token}");

        Ok(())
    }

    /// Register a bounce from `address`. Mail to the site list is registered
    /// against every list `address` belongs to.
    async fn register(
        &self,
        list: &mut MailList,
        address: &str,
        message: &Message,
    ) -> anyhow::Result<bool> {
        if !self.site.is_site_list(list.name()) {
            return Ok(list.register_bounce(address, message)?);
        }

        let mut found = false;
        for name in self.store.names().await? {
            if name == list.name() {
                found |= list.register_bounce(address, message)?;
                continue;
            }

            let mut other = match self.store.open(&name).await {
                Ok(other) => other,
                Err(err) => {
                    warn!(list = %name, "Unable to open list: {err}");
                    continue;
                }
            };

            if !other.is_member(address) {
                continue;
            }

            if let Err(err) = other.lock(self.lock_timeout).await {
                warn!(list = %name, address, "Unable to register bounce: {err}");
                continue;
            }

            let registered = match other.register_bounce(address, message) {
                Ok(true) => other.save().await.map(|()| true),
                result => result,
            };
            other.unlock().await?;
            found |= registered?;
        }

        Ok(found)
    }

    /// Returns `true` when a bounce was registered against `list`
    async fn process(
        &self,
        list: &mut MailList,
        message: &Message,
        metadata: &Metadata,
    ) -> anyhow::Result<bool> {
        let to = message.get("to").map(str::trim).unwrap_or_default();

        if to.eq_ignore_ascii_case(&self.site.owner_address()) {
            info!(list = %list.name(), "Bounce of mail to the site owner, forwarding");
            self.forward(
                message,
                metadata,
                vec![self.site.address(None)],
                &self.site.loop_address(),
            )
            .await?;
            return Ok(false);
        }

        if !list.bounce_processing() {
            debug!(list = %list.name(), "Bounce processing disabled, discarding");
            return Ok(false);
        }

        if let Some(address) = Verp::decode(&list.bounces_address(), to)
            && self.register(list, &address, message).await?
        {
            return Ok(true);
        }

        let mut registered = false;
        if let Some((detector, addresses)) = self
            .detectors
            .iter()
            .map(|detector| (detector.name(), detector.scan(message)))
            .find(|(_, addresses)| !addresses.is_empty())
        {
            debug!(list = %list.name(), detector, ?addresses, "Recognised bounce");
            for address in addresses {
                registered |= self.register(list, &address, message).await?;
            }
        }

        if registered {
            return Ok(true);
        }

        let recips: Vec<String> = list
            .owner()
            .iter()
            .chain(list.moderator())
            .cloned()
            .collect();

        if recips.is_empty() {
            warn!(list = %list.name(), "Unrecognised bounce and nobody to forward it to");
        } else {
            info!(list = %list.name(), "Unrecognised bounce, forwarding to the list owners");
            self.forward(message, metadata, recips, &self.site.admin_address())
                .await?;
        }

        Ok(false)
    }
}

#[async_trait]
impl Dispatcher for BounceRunner {
    fn name(&self) -> &'static str {
        "bounce"
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

        let result = match self.process(list, message, metadata).await {
            Ok(true) => list.save().await.map_err(Into::into),
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };

        let unlocked = list.unlock().await;
        result?;
        unlocked?;

        Ok(Disposition::Done)
    }
}
