use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_common::{Message, Metadata};
use herald_list::MailList;
use tracing::{debug, error};

use crate::{
    children::Children,
    pipeline::{HandlerRegistry, StageContext},
    runner::{Dispatcher, Disposition},
};

/// Runs postings in the `in` queue through the list's pipeline
pub struct IncomingRunner {
    registry: Arc<HandlerRegistry>,
    default_pipeline: Vec<String>,
    lock_timeout: Duration,
}

impl IncomingRunner {
    pub const fn new(
        registry: Arc<HandlerRegistry>,
        default_pipeline: Vec<String>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            default_pipeline,
            lock_timeout,
        }
    }
}

#[async_trait]
impl Dispatcher for IncomingRunner {
    fn name(&self) -> &'static str {
        "incoming"
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

        let stages = HandlerRegistry::resolve(metadata, list, &self.default_pipeline);
        let result = self
            .registry
            .run(
                stages,
                &mut StageContext {
                    list: &mut *list,
                    message,
                    metadata,
                },
            )
            .await;

        let saved = list.save().await;
        if let Err(err) = list.unlock().await {
            error!(list = %list.name(), "Unable to unlock list: {err}");
        }
        saved?;

        Ok(result?)
    }
}
