use std::sync::Arc;

use async_trait::async_trait;
use herald_common::{Metadata, metadata::keys, queued};
use herald_spool::Switchboard;

use super::{Handler, StageContext, Verdict};

/// A copy of `metadata` to travel with the message to another queue
fn forwarded(metadata: &Metadata, listname: &str) -> Metadata {
    let mut copy = metadata.clone();
    copy.remove(keys::PIPELINE);
    copy.set_listname(listname);
    copy
}

/// Discards a message this list has already distributed
pub struct LoopDetect;

#[async_trait]
impl Handler for LoopDetect {
    fn name(&self) -> &'static str {
        "LoopDetect"
    }

    async fn process(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<Verdict> {
        let posting = ctx.list.posting_address();
        let looped = ctx
            .message
            .get_all("x-beenthere")
            .any(|value| value.trim().eq_ignore_ascii_case(&posting));

        Ok(if looped {
            Verdict::Discard
        } else {
            Verdict::Continue
        })
    }
}

/// Holds postings to a moderated list until they are approved
pub struct Moderate {
    hold: Arc<Switchboard>,
}

impl Moderate {
    pub const fn new(hold: Arc<Switchboard>) -> Self {
        Self { hold }
    }
}

#[async_trait]
impl Handler for Moderate {
    fn name(&self) -> &'static str {
        "Moderate"
    }

    async fn process(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<Verdict> {
        if !ctx.list.config().moderated
            || ctx.metadata.is_approved()
            || ctx.metadata.is_fasttrack()
        {
            return Ok(Verdict::Continue);
        }

        let token = self
            .hold
            .enqueue(ctx.message, &forwarded(ctx.metadata, ctx.list.name()))
            .await?;
        queued!("Held posting to {} as {token}", ctx.list.name());

        Ok(Verdict::Hold {
            reason: "Post to moderated list".to_string(),
        })
    }
}

/// Rewrites the headers of a posting for distribution
pub struct CookHeaders;

#[async_trait]
impl Handler for CookHeaders {
    fn name(&self) -> &'static str {
        "CookHeaders"
    }

    async fn process(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<Verdict> {
        let config = ctx.list.config();
        let posting = config.posting_address();

        if ctx.metadata.original_sender().is_none()
            && let Some(sender) = ctx.message.sender()
        {
            ctx.metadata.set_original_sender(&sender);
        }

        if let Some(prefix) = config.subject_prefix.as_deref().map(str::trim)
            && !prefix.is_empty()
            && !ctx.metadata.is_digest()
            && !ctx.metadata.is_fasttrack()
        {
            let subject = ctx.message.get("subject").unwrap_or("(no subject)").to_string();
            if !subject
                .to_lowercase()
                .contains(&prefix.to_lowercase())
            {
                ctx.message.set("Subject", format!("{prefix} {subject}"));
            }
        }

        ctx.message.append("X-BeenThere", posting.clone());
        if !ctx.message.contains("precedence") {
            ctx.message.append("Precedence", "list");
        }
        ctx.message
            .set("List-Id", format!("<{}.{}>", config.name, config.host));
        ctx.message.set("List-Post", format!("<mailto:{posting}>"));

        Ok(Verdict::Continue)
    }
}

/// Works out who receives a posting, unless something already decided
pub struct CalculateRecipients;

#[async_trait]
impl Handler for CalculateRecipients {
    fn name(&self) -> &'static str {
        "CalculateRecipients"
    }

    async fn process(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<Verdict> {
        if ctx.metadata.recips().is_some() {
            return Ok(Verdict::Continue);
        }

        let sender = ctx.message.sender();
        let recips: Vec<String> = ctx
            .list
            .membership()
            .regular_recipients()
            .map(|member| member.address.clone())
            .filter(|address| sender.as_deref() != Some(address.as_str()))
            .collect();

        ctx.metadata.set_recips(recips);
        Ok(Verdict::Continue)
    }
}

/// Copies a posting into the digest queue
pub struct ToDigest {
    digest: Arc<Switchboard>,
}

impl ToDigest {
    pub const fn new(digest: Arc<Switchboard>) -> Self {
        Self { digest }
    }
}

#[async_trait]
impl Handler for ToDigest {
    fn name(&self) -> &'static str {
        "ToDigest"
    }

    async fn process(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<Verdict> {
        if ctx.list.config().digestable && !ctx.metadata.is_digest() {
            self.digest
                .enqueue(ctx.message, &forwarded(ctx.metadata, ctx.list.name()))
                .await?;
        }

        Ok(Verdict::Continue)
    }
}

/// Copies a posting into the archive queue
pub struct ToArchive {
    archive: Arc<Switchboard>,
}

impl ToArchive {
    pub const fn new(archive: Arc<Switchboard>) -> Self {
        Self { archive }
    }
}

#[async_trait]
impl Handler for ToArchive {
    fn name(&self) -> &'static str {
        "ToArchive"
    }

    async fn process(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<Verdict> {
        let opted_out = ctx
            .message
            .get("x-archive")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("no"));

        if ctx.list.config().archive && !ctx.metadata.is_digest() && !opted_out {
            self.archive
                .enqueue(ctx.message, &forwarded(ctx.metadata, ctx.list.name()))
                .await?;
        }

        Ok(Verdict::Continue)
    }
}

/// Hands a posting to the outgoing runner
pub struct ToOutgoing {
    out: Arc<Switchboard>,
}

impl ToOutgoing {
    pub const fn new(out: Arc<Switchboard>) -> Self {
        Self { out }
    }
}

#[async_trait]
impl Handler for ToOutgoing {
    fn name(&self) -> &'static str {
        "ToOutgoing"
    }

    async fn process(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<Verdict> {
        let token = self
            .out
            .enqueue(ctx.message, &forwarded(ctx.metadata, ctx.list.name()))
            .await?;
        queued!("Queued posting to {} for delivery as {token}", ctx.list.name());

        Ok(Verdict::Continue)
    }
}
