use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub address: String,

    #[serde(default)]
    pub language: Option<String>,

    /// Cleared when the member bounces too often
    #[serde(default = "default_true")]
    pub delivery_enabled: bool,

    #[serde(default)]
    pub digest: bool,
}

impl Member {
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            language: None,
            delivery_enabled: true,
            digest: false,
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }
}

/// A list's members, keyed by lower-cased address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Membership {
    members: BTreeMap<String, Member>,
}

fn key(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

impl Membership {
    pub fn is_member(&self, address: &str) -> bool {
        self.members.contains_key(&key(address))
    }

    pub fn get(&self, address: &str) -> Option<&Member> {
        self.members.get(&key(address))
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Member> {
        self.members.get_mut(&key(address))
    }

    /// Add or replace a member
    pub fn add(&mut self, member: Member) {
        self.members.insert(key(&member.address), member);
    }

    pub fn remove(&mut self, address: &str) -> Option<Member> {
        self.members.remove(&key(address))
    }

    pub fn language(&self, address: &str) -> Option<&str> {
        self.get(address).and_then(|member| member.language.as_deref())
    }

    /// Members that should receive regular (non-digest) deliveries
    pub fn regular_recipients(&self) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(|member| member.delivery_enabled && !member.digest)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut membership = Membership::default();
        membership.add(Member::new("Anne@Example.com").with_language("fr"));

        assert!(membership.is_member("anne@example.com"));
        assert!(membership.is_member(" ANNE@EXAMPLE.COM"));
        assert_eq!(membership.language("anne@example.com"), Some("fr"));
        assert!(!membership.is_member("bart@example.com"));
    }

    #[test]
    fn test_regular_recipients_skip_disabled_and_digest() {
        let mut membership = Membership::default();
        membership.add(Member::new("a@example.com"));

        let mut disabled = Member::new("b@example.com");
        disabled.delivery_enabled = false;
        membership.add(disabled);

        let mut digest = Member::new("c@example.com");
        digest.digest = true;
        membership.add(digest);

        let recipients: Vec<_> = membership
            .regular_recipients()
            .map(|member| member.address.as_str())
            .collect();
        assert_eq!(recipients, vec!["a@example.com"]);
    }
}
