use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use herald_common::{Message, Metadata, internal};
use herald_list::MailList;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, error, warn};

use super::{Delivery, DeliveryOutcome};
use crate::{bounce::Verp, children::Children};

// `sysexits.h` statuses that name the recipient as the problem
const EX_DATAERR: i32 = 65;
const EX_NOUSER: i32 = 67;
const EX_NOHOST: i32 = 68;

fn default_command() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

const fn default_max_recipients() -> usize {
    500
}

const fn default_timeout_secs() -> u64 {
    60
}

/// Delivers by piping the message to a sendmail-compatible command
///
/// ```ron
/// sendmail: (
///     command: "/usr/sbin/sendmail",
///     max_recipients: 500,
///     verp: false,
///     timeout_secs: 60,
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SendmailDelivery {
    #[serde(default = "default_command")]
    pub command: PathBuf,

    /// Recipients handed to a single invocation
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Send one copy per recipient, each with its own envelope sender
    #[serde(default)]
    pub verp: bool,

    /// How long one invocation may take before its recipients are retried
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SendmailDelivery {
    fn default() -> Self {
        Self {
            command: default_command(),
            max_recipients: default_max_recipients(),
            verp: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Sent,
    Temporary,
    Permanent,
}

/// Exit statuses that blame the recipient rather than the system
fn is_recipient_failure(code: i32) -> bool {
    matches!(code, EX_DATAERR | EX_NOUSER | EX_NOHOST)
}

impl SendmailDelivery {
    const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Hand `raw` to one invocation of the command
    ///
    /// Only an invocation for a single recipient can fail permanently; with
    /// several recipients the exit status cannot say which of them was at
    /// fault. Anything that goes wrong locally is temporary.
    async fn send(
        &self,
        sender: &str,
        recipients: &[String],
        raw: &[u8],
        children: &mut Children,
    ) -> Attempt {
        let spawned = Command::new(&self.command)
            .arg("-i")
            .arg("-f")
            .arg(sender)
            .arg("--")
            .args(recipients)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                error!(
                    command = %self.command.display(),
                    "Unable to run delivery command, recipients will be retried: {err}"
                );
                return Attempt::Temporary;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let written = tokio::time::timeout(self.timeout(), async {
                stdin.write_all(raw).await?;
                stdin.shutdown().await
            })
            .await;

            match written {
                Ok(Ok(())) => {}
                // The command closed its input early; its exit status decides
                Ok(Err(err)) => {
                    debug!("Unable to write message to {}: {err}", self.command.display());
                }
                Err(_) => {
                    // Closing the pipe would hand the command a truncated message
                    warn!(
                        pid = child.id(),
                        "Timed out writing message to {}, killing it",
                        self.command.display()
                    );
                    if let Err(err) = child.start_kill() {
                        error!("Unable to kill delivery command: {err}");
                    }
                    children.adopt(child);
                    return Attempt::Temporary;
                }
            }
        }

        match tokio::time::timeout(self.timeout(), child.wait()).await {
            Ok(Ok(status)) => match status.code() {
                Some(0) => Attempt::Sent,
                Some(code) if is_recipient_failure(code) && recipients.len() == 1 => {
                    debug!(code, "Delivery command rejected the recipient");
                    Attempt::Permanent
                }
                code => {
                    debug!(?code, "Delivery command failed, recipients will be retried");
                    Attempt::Temporary
                }
            },
            Ok(Err(err)) => {
                error!("Unable to wait for delivery command: {err}");
                Attempt::Temporary
            }
            Err(_) => {
                warn!(
                    pid = child.id(),
                    "Delivery command timed out, recipients will be retried"
                );
                children.adopt(child);
                Attempt::Temporary
            }
        }
    }
}

#[async_trait]
impl Delivery for SendmailDelivery {
    async fn deliver(
        &self,
        list: &MailList,
        message: &Message,
        metadata: &Metadata,
        children: &mut Children,
    ) -> anyhow::Result<DeliveryOutcome> {
        let recipients = metadata.recips().unwrap_or_default();
        if recipients.is_empty() {
            internal!("No recipients for message to {}", list.name());
            return Ok(DeliveryOutcome::Delivered);
        }

        let bounces = list.bounces_address();
        let sender = metadata.envsender().map_or_else(|| bounces.clone(), str::to_string);
        let raw = message.to_bytes();

        let mut permanent = Vec::new();
        let mut temporary = Vec::new();

        if self.verp || metadata.verp() {
            for recipient in &recipients {
                let sender = Verp::encode(&bounces, recipient).unwrap_or_else(|| sender.clone());
                match self
                    .send(&sender, std::slice::from_ref(recipient), &raw, children)
                    .await
                {
                    Attempt::Sent => {}
                    Attempt::Temporary => temporary.push(recipient.clone()),
                    Attempt::Permanent => permanent.push(recipient.clone()),
                }
            }
        } else {
            for chunk in recipients.chunks(self.max_recipients.max(1)) {
                match self.send(&sender, chunk, &raw, children).await {
                    Attempt::Sent => {}
                    Attempt::Temporary => temporary.extend_from_slice(chunk),
                    Attempt::Permanent => permanent.extend_from_slice(chunk),
                }
            }
        }

        if permanent.is_empty() && temporary.is_empty() {
            Ok(DeliveryOutcome::Delivered)
        } else {
            Ok(DeliveryOutcome::SomeRecipientsFailed {
                permanent,
                temporary,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use herald_list::{ListConfig, ListStore};
    use pretty_assertions::assert_eq;

    use super::*;

    /// A stand-in for sendmail running `body` as a shell script
    fn script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    async fn deliver_via(
        delivery: &SendmailDelivery,
        message: &Message,
        recips: &[&str],
        children: &mut Children,
    ) -> DeliveryOutcome {
        let dir = tempfile::tempdir().expect("tempdir");
        let list = ListStore::new(dir.path())
            .create(ListConfig::new("x", "example.com"))
            .await
            .expect("create");

        let mut metadata = Metadata::new();
        metadata.set_recips(recips.iter().copied());

        delivery
            .deliver(&list, message, &metadata, children)
            .await
            .expect("deliver")
    }

    async fn deliver_with(command: impl Into<PathBuf>, recips: &[&str]) -> DeliveryOutcome {
        let delivery = SendmailDelivery {
            command: command.into(),
            ..SendmailDelivery::default()
        };
        deliver_via(&delivery, &Message::default(), recips, &mut Children::new()).await
    }

    fn temporary(addresses: &[&str]) -> DeliveryOutcome {
        DeliveryOutcome::SomeRecipientsFailed {
            permanent: Vec::new(),
            temporary: addresses.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn test_successful_command_delivers() {
        assert_eq!(
            deliver_with("true", &["a@example.com"]).await,
            DeliveryOutcome::Delivered
        );
    }

    #[tokio::test]
    async fn test_failing_command_is_retried() {
        assert_eq!(
            deliver_with("false", &["a@example.com", "b@example.com"]).await,
            temporary(&["a@example.com", "b@example.com"])
        );
    }

    #[tokio::test]
    async fn test_local_error_never_blames_recipients() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recips = ["a@example.com", "b@example.com", "c@example.com"];

        for code in [69, 70, 71, 74, 75] {
            assert_eq!(
                deliver_with(script(dir.path(), &format!("exit-{code}"), &format!("exit {code}")), &recips).await,
                temporary(&recips),
                "exit {code}"
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_user_is_permanent_for_a_single_recipient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let command = script(dir.path(), "nouser", "exit 67");

        assert_eq!(
            deliver_with(command.clone(), &["a@example.com"]).await,
            DeliveryOutcome::SomeRecipientsFailed {
                permanent: vec!["a@example.com".to_string()],
                temporary: Vec::new(),
            }
        );
        assert_eq!(
            deliver_with(command, &["a@example.com", "b@example.com"]).await,
            temporary(&["a@example.com", "b@example.com"])
        );
    }

    #[tokio::test]
    async fn test_missing_command_keeps_earlier_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Delivers the first chunk, then removes itself
        let command = script(dir.path(), "once", "rm -f \"$0\"\ncat > /dev/null");

        let delivery = SendmailDelivery {
            command,
            max_recipients: 1,
            ..SendmailDelivery::default()
        };
        assert_eq!(
            deliver_via(
                &delivery,
                &Message::default(),
                &["a@example.com", "b@example.com", "c@example.com"],
                &mut Children::new(),
            )
            .await,
            temporary(&["b@example.com", "c@example.com"])
        );
    }

    #[tokio::test]
    async fn test_write_timeout_kills_the_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let delivery = SendmailDelivery {
            command: script(dir.path(), "stalled", "exec sleep 30"),
            timeout_secs: 1,
            ..SendmailDelivery::default()
        };

        let mut message = Message::default();
        message.set_body(vec![b'x'; 4 << 20]);

        let mut children = Children::new();
        assert_eq!(
            deliver_via(&delivery, &message, &["a@example.com"], &mut children).await,
            temporary(&["a@example.com"])
        );
        assert_eq!(children.len(), 1);

        for _ in 0..100 {
            if children.reap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn test_no_recipients_is_delivered() {
        assert_eq!(deliver_with("false", &[]).await, DeliveryOutcome::Delivered);
    }
}
