#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use herald_common::{Message, Metadata};
use herald_list::{ListConfig, ListStore, MailList, Member};
use herald_runner::{Dispatcher, ListCache, Runner, RunnerConfig};
use herald_spool::{QueueConfig, Switchboard, queues};
use tempfile::TempDir;

pub const HOST: &str = "lists.example.com";
pub const TIMEOUT: Duration = Duration::from_millis(200);

pub struct Fixture {
    pub dir: TempDir,
    pub queues: QueueConfig,
    pub store: ListStore,
}

impl Fixture {
    /// A store holding list `x` with members anne (German) and bart
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let queues = QueueConfig::new(dir.path().join("qfiles"));
        let store = ListStore::new(dir.path().join("lists"));

        let fixture = Self { dir, queues, store };
        fixture.create_list("x", |config| config.owner = vec!["owner@example.com".to_string()])
            .await;
        fixture
    }

    pub async fn create_list(&self, name: &str, configure: impl FnOnce(&mut ListConfig)) {
        let mut config = ListConfig::new(name, HOST);
        configure(&mut config);

        let mut list = self.store.create(config).await.expect("create list");
        list.lock(TIMEOUT).await.expect("lock");
        list.membership_mut()
            .add(Member::new("anne@example.com").with_language("de"));
        list.membership_mut().add(Member::new("bart@example.com"));
        list.save().await.expect("save");
        list.unlock().await.expect("unlock");
    }

    pub async fn list(&self, name: &str) -> MailList {
        self.store.open(name).await.expect("open list")
    }

    pub fn queue(&self, name: &str) -> Arc<Switchboard> {
        Arc::new(self.queues.open(name).expect("open queue"))
    }

    pub fn runner<D: Dispatcher>(&self, queue: &str, dispatcher: D) -> Runner<D> {
        Runner::new(
            dispatcher,
            self.queue(queue),
            self.queue(queues::SHUNT),
            ListCache::new(self.store.clone(), true),
            RunnerConfig {
                sleep_secs: 0,
                lock_timeout_secs: 0,
                ..RunnerConfig::default()
            },
        )
    }

    /// Every entry currently in `queue`, in order
    pub async fn entries(&self, queue: &str) -> Vec<(Message, Metadata)> {
        let switchboard = self.queue(queue);
        let mut entries = Vec::new();
        for token in switchboard.files().await.expect("files") {
            let entry = switchboard
                .dequeue(&token)
                .await
                .expect("dequeue")
                .expect("entry");
            switchboard.finish(&token).await.expect("finish");
            entries.push(entry);
        }
        entries
    }

    pub async fn count(&self, queue: &str) -> usize {
        self.queue(queue).files().await.expect("files").len()
    }
}

pub fn posting(subject: &str) -> Message {
    Message::from_parts(
        [
            ("From", "Anne Person <anne@example.com>"),
            ("To", "x@lists.example.com"),
            ("Subject", subject),
            ("Message-ID", "<p1@example.com>"),
        ],
        "Hello list\n",
    )
    .expect("message")
}

pub fn for_list(name: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.set_listname(name);
    metadata
}
