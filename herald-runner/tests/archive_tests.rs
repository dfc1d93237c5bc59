#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{Fixture, TIMEOUT, for_list, posting};
use herald_runner::{ArchRunner, ArchiveConfig, ClobberPolicy, MboxArchiver};
use herald_spool::queues;
use pretty_assertions::assert_eq;

fn arch_runner(fixture: &Fixture, clobber_date: ClobberPolicy) -> ArchRunner<MboxArchiver> {
    let config = ArchiveConfig {
        clobber_date,
        archive_root: fixture.dir.path().join("archives"),
        ..ArchiveConfig::default()
    };
    ArchRunner::new(MboxArchiver::new(&config.archive_root), config, TIMEOUT)
}

#[tokio::test]
async fn test_posting_is_appended_to_the_list_mbox() {
    let fixture = Fixture::new().await;
    let queue = fixture.queue(queues::ARCHIVE);
    for subject in ["first", "second"] {
        let mut message = posting(subject);
        message.append("Date", "Mon, 1 Jan 2001 00:00:00 +0000");
        queue
            .enqueue(&message, &for_list("x"))
            .await
            .expect("enqueue");
    }

    let mut runner = fixture.runner(queues::ARCHIVE, arch_runner(&fixture, ClobberPolicy::Never));
    assert_eq!(runner.run_once().await.expect("scan"), 2);

    let mbox = std::fs::read_to_string(fixture.dir.path().join("archives").join("x.mbox"))
        .expect("mbox");
    let separators = mbox
        .lines()
        .filter(|line| line.starts_with("From anne@example.com "))
        .count();
    assert_eq!(separators, 2);
    assert!(mbox.contains("Subject: first\n"));
    assert!(mbox.contains("Subject: second\n"));
    assert!(mbox.contains("Date: Mon, 1 Jan 2001 00:00:00 +0000\n"));
    assert_eq!(fixture.count(queues::ARCHIVE).await, 0);
}

#[tokio::test]
async fn test_missing_date_is_filled_from_received_time() {
    let fixture = Fixture::new().await;
    let mut metadata = for_list("x");
    metadata.set_received_time(1_000_000_000.0);
    fixture
        .queue(queues::ARCHIVE)
        .enqueue(&posting("undated"), &metadata)
        .await
        .expect("enqueue");

    let mut runner = fixture.runner(queues::ARCHIVE, arch_runner(&fixture, ClobberPolicy::Never));
    runner.run_once().await.expect("scan");

    let mbox = std::fs::read_to_string(fixture.dir.path().join("archives").join("x.mbox"))
        .expect("mbox");
    let date = mbox
        .lines()
        .find_map(|line| line.strip_prefix("Date: "))
        .expect("date header");
    assert_eq!(mailparse::dateparse(date), Ok(1_000_000_000));
    assert!(!mbox.contains("X-Original-Date"));
}

#[tokio::test]
async fn test_busy_list_is_retried_later() {
    let fixture = Fixture::new().await;
    fixture
        .queue(queues::ARCHIVE)
        .enqueue(&posting("wait"), &for_list("x"))
        .await
        .expect("enqueue");

    let mut holder = fixture.list("x").await;
    holder.lock(TIMEOUT).await.expect("lock");

    let mut runner = fixture.runner(queues::ARCHIVE, arch_runner(&fixture, ClobberPolicy::Always));
    runner.run_once().await.expect("scan");

    assert_eq!(fixture.count(queues::ARCHIVE).await, 1);
    assert!(!fixture.dir.path().join("archives").join("x.mbox").exists());
    holder.unlock().await.expect("unlock");
}
