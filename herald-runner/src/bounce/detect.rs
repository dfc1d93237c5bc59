use herald_common::Message;

/// Recognises the bounce format of one kind of MTA
pub trait Bouncer: Send + Sync {
    fn name(&self) -> &'static str;

    /// The addresses `message` reports as undeliverable, lower-cased. Empty
    /// when the message is not in this detector's format.
    fn scan(&self, message: &Message) -> Vec<String>;
}

/// Every built-in detector
///
/// # Errors
/// If a detector's patterns fail to compile
pub fn builtin() -> Result<Vec<Box<dyn Bouncer>>, regex::Error> {
    Ok(vec![Box::new(super::Dsn), Box::new(super::Postfix::new()?)])
}

/// `<addr>`, `addr` or `rfc822; addr`, normalised
pub(super) fn clean_address(raw: &str) -> Option<String> {
    let address = raw
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();

    (address.contains('@') && !address.contains(char::is_whitespace))
        .then(|| address.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_address() {
        assert_eq!(clean_address(" <A@Example.com> ").as_deref(), Some("a@example.com"));
        assert_eq!(clean_address("postmaster"), None);
        assert_eq!(clean_address("a b@example.com"), None);
    }
}
