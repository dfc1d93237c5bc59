//! Variable envelope return paths.
//!
//! A recipient `member@their.host` is folded into the list's bounces address
//! as `list-bounces+member=their.host@list.host`, so a bounce names the
//! member that caused it without having to be parsed.

use mailparse::MailAddr;

pub struct Verp;

fn split(address: &str) -> Option<(&str, &str)> {
    address
        .rsplit_once('@')
        .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
}

impl Verp {
    /// The envelope sender to use for mail to `recipient`
    pub fn encode(bounces: &str, recipient: &str) -> Option<String> {
        let (mailbox, host) = split(bounces)?;
        let (local, domain) = split(recipient)?;
        Some(format!("{mailbox}+{local}={domain}@{host}"))
    }

    /// The member address folded into `to`, if `to` is a VERP form of
    /// `bounces`
    pub fn decode(bounces: &str, to: &str) -> Option<String> {
        let (mailbox, _) = split(bounces)?;

        let address = match mailparse::addrparse(to).ok()?.iter().next()? {
            MailAddr::Single(single) => single.addr.clone(),
            MailAddr::Group(group) => group.addrs.first()?.addr.clone(),
        };
        let (local, _) = split(&address)?;

        let encoded = local
            .get(..mailbox.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(mailbox))
            .and_then(|_| local.get(mailbox.len()..))?
            .strip_prefix('+')?;

        let (member, domain) = encoded.rsplit_once('=')?;
        if member.is_empty() || domain.is_empty() {
            return None;
        }

        Some(format!("{member}@{domain}").to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const BOUNCES: &str = "x-bounces@lists.example.com";

    #[test]
    fn test_encode() {
        assert_eq!(
            Verp::encode(BOUNCES, "anne@person.org").as_deref(),
            Some("x-bounces+anne=person.org@lists.example.com")
        );
        assert_eq!(Verp::encode(BOUNCES, "no-domain"), None);
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            Verp::decode(BOUNCES, "X-Bounces+Anne=Person.org@lists.example.com").as_deref(),
            Some("anne@person.org")
        );
        assert_eq!(
            Verp::decode(BOUNCES, "<x-bounces+a=b=c.org@lists.example.com>").as_deref(),
            Some("a=b@c.org")
        );
    }

    #[test]
    fn test_decode_rejects_other_addresses() {
        assert_eq!(Verp::decode(BOUNCES, "x-bounces@lists.example.com"), None);
        assert_eq!(Verp::decode(BOUNCES, "y-bounces+a=b.org@lists.example.com"), None);
        assert_eq!(Verp::decode(BOUNCES, "x-bounces+=b.org@lists.example.com"), None);
        assert_eq!(Verp::decode(BOUNCES, "x-bounces+ab.org@lists.example.com"), None);
        assert_eq!(Verp::decode(BOUNCES, "not an address"), None);
    }
}
