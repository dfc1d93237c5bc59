use herald_common::Message;
use mailparse::ParsedMail;

use super::detect::{Bouncer, clean_address};

/// RFC 3464 delivery status notifications
///
/// Only recipients whose `Action:` is `failed` are reported; delays are
/// ignored.
pub struct Dsn;

fn delivery_status<'a>(part: &'a ParsedMail<'a>) -> Option<&'a ParsedMail<'a>> {
    if part.ctype.mimetype.eq_ignore_ascii_case("message/delivery-status") {
        return Some(part);
    }
    part.subparts.iter().find_map(delivery_status)
}

fn failed_recipients(status: &str) -> Vec<String> {
    let mut found = Vec::new();

    for block in status.replace("\r\n", "\n").split("\n\n") {
        let mut action = None;
        let mut recipient = None;

        for line in block.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match name.trim().to_ascii_lowercase().as_str() {
                "action" => action = Some(value.to_ascii_lowercase()),
                "final-recipient" => recipient = Some(value),
                "original-recipient" if recipient.is_none() => recipient = Some(value),
                _ => {}
            }
        }

        if action.as_deref() == Some("failed")
            && let Some(recipient) = recipient
            && let Some(address) =
                clean_address(recipient.split_once(';').map_or(recipient, |(_, address)| address))
        {
            found.push(address);
        }
    }

    found
}

impl Bouncer for Dsn {
    fn name(&self) -> &'static str {
        "dsn"
    }

    fn scan(&self, message: &Message) -> Vec<String> {
        message
            .with_mime(|parsed| {
                if !parsed.ctype.mimetype.eq_ignore_ascii_case("multipart/report") {
                    return Vec::new();
                }

                delivery_status(parsed)
                    .and_then(|status| status.get_body().ok())
                    .map(|body| failed_recipients(&body))
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const REPORT: &[u8] = b"From: MAILER-DAEMON@example.com\n\
To: x-bounces@lists.example.com\n\
Subject: Delivery Status Notification (Failure)\n\
MIME-Version: 1.0\n\
Content-Type: multipart/report; report-type=delivery-status; boundary=\"B\"\n\
\n\
--B\n\
Content-Type: text/plain\n\
\n\
Your message could not be delivered.\n\
\n\
--B\n\
Content-Type: message/delivery-status\n\
\n\
Reporting-MTA: dns; mx.example.com\n\
\n\
Final-Recipient: rfc822; <Gone@Example.org>\n\
Action: failed\n\
Status: 5.1.1\n\
\n\
Final-Recipient: rfc822; slow@example.org\n\
Action: delayed\n\
Status: 4.4.1\n\
\n\
--B--\n";

    #[test]
    fn test_failed_recipients_found() {
        let message = Message::parse(REPORT).expect("parse");
        assert_eq!(Dsn.scan(&message), vec!["gone@example.org".to_string()]);
    }

    #[test]
    fn test_plain_message_ignored() {
        let message = Message::parse(b"From: a@example.com\nSubject: hi\n\nhello\n").expect("parse");
        assert!(Dsn.scan(&message).is_empty());
    }
}
