use herald_common::Message;
use regex::Regex;

use super::detect::{Bouncer, clean_address};

/// Postfix's own "undeliverable mail" notices
///
/// The notice is the first `text/plain` part of a `multipart/mixed` message
/// and is described as `notification`. Addresses follow the line introducing
/// the postfix program.
pub struct Postfix {
    salutation: Regex,
    address: Regex,
}

impl Postfix {
    /// # Errors
    /// If the detector's patterns fail to compile
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            salutation: Regex::new(r"(?i)^\t\t\tthe postfix program$")?,
            address: Regex::new(r"<([^>]*)>:")?,
        })
    }

    fn addresses(&self, notice: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut salutation_seen = false;

        for line in notice.lines().map(str::trim_end) {
            if !salutation_seen {
                salutation_seen = self.salutation.is_match(line);
            } else if let Some(address) = self
                .address
                .captures(line)
                .and_then(|captures| captures.get(1))
                .and_then(|address| clean_address(address.as_str()))
            {
                found.push(address);
            }
        }

        found
    }
}

impl Bouncer for Postfix {
    fn name(&self) -> &'static str {
        "postfix"
    }

    fn scan(&self, message: &Message) -> Vec<String> {
        message
            .with_mime(|parsed| {
                if !parsed.ctype.mimetype.eq_ignore_ascii_case("multipart/mixed") {
                    return Vec::new();
                }

                let Some(notice) = parsed
                    .subparts
                    .iter()
                    .find(|part| part.ctype.mimetype.eq_ignore_ascii_case("text/plain"))
                else {
                    return Vec::new();
                };

                let described = notice
                    .headers
                    .iter()
                    .find(|header| header.get_key().eq_ignore_ascii_case("content-description"))
                    .is_some_and(|header| header.get_value().trim().eq_ignore_ascii_case("notification"));

                if !described {
                    return Vec::new();
                }

                notice
                    .get_body()
                    .map(|body| self.addresses(&body))
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}
