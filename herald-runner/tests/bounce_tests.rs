#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{Fixture, HOST, TIMEOUT, for_list};
use herald_common::Message;
use herald_runner::{BounceRunner, SiteConfig, bounce::builtin_detectors};
use herald_spool::queues;
use pretty_assertions::assert_eq;

fn site() -> SiteConfig {
    SiteConfig {
        site_list: "mailman".to_string(),
        host: HOST.to_string(),
    }
}

fn bounce_runner(fixture: &Fixture) -> BounceRunner {
    BounceRunner::new(
        fixture.queue(queues::OUT),
        fixture.store.clone(),
        site(),
        builtin_detectors().expect("detectors"),
        TIMEOUT,
    )
}

fn bounce_to(to: &str, body: &str) -> Message {
    Message::from_parts(
        [
            ("From", "MAILER-DAEMON@mx.example.com"),
            ("To", to),
            ("Subject", "Undeliverable"),
            ("Message-ID", "<bounce@mx.example.com>"),
        ],
        body,
    )
    .expect("message")
}

const DSN: &str = "From: MAILER-DAEMON@mx.example.com\n\
To: x-bounces@lists.example.com\n\
Subject: Delivery Status Notification\n\
MIME-Version: 1.0\n\
Content-Type: multipart/report; report-type=delivery-status; boundary=\"B\"\n\
\n\
--B\n\
Content-Type: text/plain\n\
\n\
Delivery failed.\n\
\n\
--B\n\
Content-Type: message/delivery-status\n\
\n\
Reporting-MTA: dns; mx.example.com\n\
\n\
Final-Recipient: rfc822; bart@example.com\n\
Action: failed\n\
Status: 5.1.1\n\
\n\
--B--\n";

#[tokio::test]
async fn test_verp_bounce_registers_once_without_forwarding() {
    let fixture = Fixture::new().await;
    let before = fixture.list("x").await.bounces().count("anne@example.com");

    fixture
        .queue(queues::BOUNCES)
        .enqueue(
            &bounce_to("x-bounces+anne=example.com@lists.example.com", "gone\n"),
            &for_list("x"),
        )
        .await
        .expect("enqueue");

    let mut runner = fixture.runner(queues::BOUNCES, bounce_runner(&fixture));
    runner.run_once().await.expect("scan");

    let list = fixture.list("x").await;
    assert_eq!(list.bounces().count("anne@example.com"), before + 1);
    assert_eq!(list.bounces().count("bart@example.com"), 0);
    assert_eq!(fixture.count(queues::OUT).await, 0);
    assert_eq!(fixture.count(queues::BOUNCES).await, 0);
    assert!(!list.dir().join("lock").exists());
}

#[tokio::test]
async fn test_dsn_bounce_registers_the_failed_recipient() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::BOUNCES)
        .enqueue(&Message::parse(DSN.as_bytes()).expect("parse"), &for_list("x"))
        .await
        .expect("enqueue");

    let mut runner = fixture.runner(queues::BOUNCES, bounce_runner(&fixture));
    runner.run_once().await.expect("scan");

    assert_eq!(
        fixture.list("x").await.bounces().count("bart@example.com"),
        1
    );
    assert_eq!(fixture.count(queues::OUT).await, 0);
}

#[tokio::test]
async fn test_unrecognised_bounce_goes_to_the_owners() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::BOUNCES)
        .enqueue(
            &bounce_to("x-bounces@lists.example.com", "something odd\n"),
            &for_list("x"),
        )
        .await
        .expect("enqueue");

    let mut runner = fixture.runner(queues::BOUNCES, bounce_runner(&fixture));
    runner.run_once().await.expect("scan");

    let forwarded = fixture.entries(queues::OUT).await;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(
        forwarded[0].1.recips(),
        Some(vec!["owner@example.com".to_string()])
    );
    assert_eq!(
        forwarded[0].1.envsender(),
        Some("mailman-admin@lists.example.com")
    );
}

#[tokio::test]
async fn test_bounce_to_site_owner_is_forwarded_with_loop_sender() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::BOUNCES)
        .enqueue(
            &bounce_to("mailman-owner@lists.example.com", "owner bounced\n"),
            &for_list("x"),
        )
        .await
        .expect("enqueue");

    let mut runner = fixture.runner(queues::BOUNCES, bounce_runner(&fixture));
    runner.run_once().await.expect("scan");

    let forwarded = fixture.entries(queues::OUT).await;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(
        forwarded[0].1.recips(),
        Some(vec!["mailman@lists.example.com".to_string()])
    );
    assert_eq!(
        forwarded[0].1.envsender(),
        Some("mailman-loop@lists.example.com")
    );
}

#[tokio::test]
async fn test_disabled_bounce_processing_discards() {
    let fixture = Fixture::new().await;
    fixture
        .create_list("quiet", |config| config.bounce_processing = false)
        .await;
    fixture
        .queue(queues::BOUNCES)
        .enqueue(
            &bounce_to("quiet-bounces+anne=example.com@lists.example.com", "gone\n"),
            &for_list("quiet"),
        )
        .await
        .expect("enqueue");

    let mut runner = fixture.runner(queues::BOUNCES, bounce_runner(&fixture));
    runner.run_once().await.expect("scan");

    assert_eq!(
        fixture.list("quiet").await.bounces().count("anne@example.com"),
        0
    );
    assert_eq!(fixture.count(queues::OUT).await, 0);
    assert_eq!(fixture.count(queues::BOUNCES).await, 0);
}

#[tokio::test]
async fn test_site_list_bounce_reaches_every_list() {
    let fixture = Fixture::new().await;
    fixture.create_list("mailman", |_| {}).await;
    fixture.create_list("y", |_| {}).await;

    fixture
        .queue(queues::BOUNCES)
        .enqueue(
            &bounce_to("mailman-bounces+bart=example.com@lists.example.com", "gone\n"),
            &for_list("mailman"),
        )
        .await
        .expect("enqueue");

    let mut runner = fixture.runner(queues::BOUNCES, bounce_runner(&fixture));
    runner.run_once().await.expect("scan");

    for name in ["mailman", "x", "y"] {
        assert_eq!(
            fixture.list(name).await.bounces().count("bart@example.com"),
            1,
            "{name}"
        );
    }
    assert_eq!(fixture.count(queues::OUT).await, 0);
}

#[tokio::test]
async fn test_busy_list_is_retried_later() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::BOUNCES)
        .enqueue(
            &bounce_to("x-bounces+anne=example.com@lists.example.com", "gone\n"),
            &for_list("x"),
        )
        .await
        .expect("enqueue");

    let mut holder = fixture.list("x").await;
    holder.lock(TIMEOUT).await.expect("lock");

    let mut runner = fixture.runner(queues::BOUNCES, bounce_runner(&fixture));
    runner.run_once().await.expect("scan");
    assert_eq!(fixture.count(queues::BOUNCES).await, 1);

    holder.unlock().await.expect("unlock");
    runner.run_once().await.expect("scan");
    assert_eq!(fixture.count(queues::BOUNCES).await, 0);
    assert_eq!(fixture.list("x").await.bounces().count("anne@example.com"), 1);
}
