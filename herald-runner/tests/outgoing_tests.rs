#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use common::{Fixture, TIMEOUT, for_list, posting};
use herald_common::{Message, Metadata};
use herald_list::MailList;
use herald_runner::{
    Children, Delivery, DeliveryOutcome, OutgoingRunner, RetryPolicy, outgoing::now,
};
use herald_spool::queues;
use pretty_assertions::assert_eq;

/// Returns the scripted outcomes in order, then `Delivered`
#[derive(Clone, Default)]
struct Scripted {
    outcomes: Arc<Mutex<VecDeque<DeliveryOutcome>>>,
    attempts: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Scripted {
    fn new(outcomes: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            attempts: Arc::default(),
        }
    }
}

#[async_trait]
impl Delivery for Scripted {
    async fn deliver(
        &self,
        _list: &MailList,
        _message: &Message,
        metadata: &Metadata,
        _children: &mut Children,
    ) -> anyhow::Result<DeliveryOutcome> {
        self.attempts
            .lock()
            .unwrap()
            .push(metadata.recips().unwrap_or_default());

        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DeliveryOutcome::Delivered))
    }
}

fn temporary(addresses: &[&str]) -> DeliveryOutcome {
    DeliveryOutcome::SomeRecipientsFailed {
        permanent: Vec::new(),
        temporary: addresses.iter().map(|a| (*a).to_string()).collect(),
    }
}

fn outgoing(recips: &[&str]) -> Metadata {
    let mut metadata = for_list("x");
    metadata.set_recips(recips.iter().copied());
    metadata
}

#[tokio::test]
async fn test_delivered_message_is_done() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::OUT)
        .enqueue(&posting("ok"), &outgoing(&["anne@example.com"]))
        .await
        .expect("enqueue");

    let delivery = Scripted::new([]);
    let runner = OutgoingRunner::new(delivery.clone(), RetryPolicy::default(), TIMEOUT);
    fixture.runner(queues::OUT, runner).run_once().await.expect("scan");

    assert_eq!(fixture.count(queues::OUT).await, 0);
    assert_eq!(delivery.attempts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_retries_only_temporary_failures() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::OUT)
        .enqueue(
            &posting("partial"),
            &outgoing(&["anne@example.com", "bart@example.com", "carl@example.com"]),
        )
        .await
        .expect("enqueue");

    let delivery = Scripted::new([temporary(&["bart@example.com"])]);
    let runner = OutgoingRunner::new(delivery.clone(), RetryPolicy::default(), TIMEOUT);
    let mut runner = fixture.runner(queues::OUT, runner);

    runner.run_once().await.expect("scan");
    runner.run_once().await.expect("scan");

    assert_eq!(
        *delivery.attempts.lock().unwrap(),
        vec![
            vec![
                "anne@example.com".to_string(),
                "bart@example.com".to_string(),
                "carl@example.com".to_string()
            ],
            vec!["bart@example.com".to_string()],
        ]
    );
    assert_eq!(fixture.count(queues::OUT).await, 0);
}

#[tokio::test]
async fn test_gives_up_when_the_window_closes_without_progress() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::OUT)
        .enqueue(&posting("stuck"), &outgoing(&["anne@example.com"]))
        .await
        .expect("enqueue");

    let stuck = temporary(&["anne@example.com"]);
    let delivery = Scripted::new([stuck.clone(), stuck.clone(), stuck]);
    let retry = RetryPolicy::new(Duration::ZERO);
    let mut runner = fixture.runner(queues::OUT, OutgoingRunner::new(delivery.clone(), retry, TIMEOUT));

    runner.run_once().await.expect("scan");
    assert_eq!(fixture.count(queues::OUT).await, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    runner.run_once().await.expect("scan");

    assert_eq!(fixture.count(queues::OUT).await, 0);
    assert_eq!(delivery.attempts.lock().unwrap().len(), 2);
    assert_eq!(fixture.count(queues::SHUNT).await, 0);
}

#[tokio::test]
async fn test_progress_extends_an_expired_window() {
    let fixture = Fixture::new().await;
    let mut metadata = outgoing(&["anne@example.com", "bart@example.com"]);
    metadata.set_last_recip_count(2);
    metadata.set_deliver_until(now() - 60.0);
    fixture
        .queue(queues::OUT)
        .enqueue(&posting("slow"), &metadata)
        .await
        .expect("enqueue");

    let delivery = Scripted::new([temporary(&["anne@example.com"])]);
    let retry = RetryPolicy::new(Duration::from_secs(3600));
    let mut runner = fixture.runner(queues::OUT, OutgoingRunner::new(delivery, retry, TIMEOUT));
    runner.run_once().await.expect("scan");

    let requeued = fixture.entries(queues::OUT).await;
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].1.last_recip_count(), 1);
    assert!(requeued[0].1.deliver_until().expect("deadline") > now() + 3000.0);
    assert_eq!(
        requeued[0].1.recips(),
        Some(vec!["anne@example.com".to_string()])
    );
}

#[tokio::test]
async fn test_permanent_failures_are_registered_as_bounces() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::OUT)
        .enqueue(&posting("gone"), &outgoing(&["anne@example.com", "zed@example.com"]))
        .await
        .expect("enqueue");

    let delivery = Scripted::new([DeliveryOutcome::SomeRecipientsFailed {
        permanent: vec!["anne@example.com".to_string(), "zed@example.com".to_string()],
        temporary: Vec::new(),
    }]);
    let mut runner = fixture.runner(
        queues::OUT,
        OutgoingRunner::new(delivery, RetryPolicy::default(), TIMEOUT),
    );
    runner.run_once().await.expect("scan");

    assert_eq!(runner.dispatcher().pending_bounces(), 0);
    assert_eq!(fixture.count(queues::OUT).await, 0);

    let list = fixture.list("x").await;
    assert_eq!(list.bounces().count("anne@example.com"), 1);
    assert_eq!(list.bounces().count("zed@example.com"), 0);
}

#[tokio::test]
async fn test_busy_list_defers_bounce_registration() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::OUT)
        .enqueue(&posting("later"), &outgoing(&["anne@example.com"]))
        .await
        .expect("enqueue");

    let delivery = Scripted::new([DeliveryOutcome::SomeRecipientsFailed {
        permanent: vec!["anne@example.com".to_string()],
        temporary: Vec::new(),
    }]);
    let mut runner = fixture.runner(
        queues::OUT,
        OutgoingRunner::new(delivery, RetryPolicy::default(), TIMEOUT),
    );

    let mut holder = fixture.list("x").await;
    holder.lock(TIMEOUT).await.expect("lock");
    runner.run_once().await.expect("scan");
    assert_eq!(runner.dispatcher().pending_bounces(), 1);
    holder.unlock().await.expect("unlock");

    assert_eq!(fixture.count(queues::OUT).await, 0);

    // The queue is empty now; the next pass still registers the bounce
    assert_eq!(runner.run_once().await.expect("scan"), 0);
    assert_eq!(runner.dispatcher().pending_bounces(), 0);
    assert_eq!(fixture.list("x").await.bounces().count("anne@example.com"), 1);
}

#[tokio::test]
async fn test_deferred_bounces_are_kept_until_cleanup() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::OUT)
        .enqueue(&posting("later"), &outgoing(&["anne@example.com"]))
        .await
        .expect("enqueue");

    let delivery = Scripted::new([DeliveryOutcome::SomeRecipientsFailed {
        permanent: vec!["anne@example.com".to_string()],
        temporary: Vec::new(),
    }]);
    let mut runner = fixture.runner(
        queues::OUT,
        OutgoingRunner::new(delivery, RetryPolicy::default(), TIMEOUT),
    );

    let mut holder = fixture.list("x").await;
    holder.lock(TIMEOUT).await.expect("lock");
    runner.run_once().await.expect("scan");
    runner.run_once().await.expect("idle scan");
    assert_eq!(runner.dispatcher().pending_bounces(), 1);
    holder.unlock().await.expect("unlock");

    runner.cleanup().await;
    assert_eq!(runner.dispatcher().pending_bounces(), 0);
    assert_eq!(fixture.list("x").await.bounces().count("anne@example.com"), 1);
}
