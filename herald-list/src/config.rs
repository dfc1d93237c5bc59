use serde::{Deserialize, Serialize};

fn default_language() -> String {
    herald_common::i18n::DEFAULT_LANGUAGE.to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_bounce_score_threshold() -> f64 {
    5.0
}

const fn default_bounce_info_stale_after_secs() -> u64 {
    7 * 24 * 60 * 60
}

/// Per-list settings, persisted alongside the list's members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListConfig {
    /// Short name, also the list's directory name
    pub name: String,

    /// Mail host the list's addresses live on
    pub host: String,

    #[serde(default = "default_language")]
    pub preferred_language: String,

    #[serde(default)]
    pub owner: Vec<String>,

    #[serde(default)]
    pub moderator: Vec<String>,

    /// Whether postings must be approved before they are distributed
    #[serde(default)]
    pub moderated: bool,

    /// Prepended to the subject of every posting, e.g. `[x] `
    #[serde(default)]
    pub subject_prefix: Option<String>,

    #[serde(default = "default_true")]
    pub digestable: bool,

    #[serde(default = "default_true")]
    pub archive: bool,

    #[serde(default = "default_true")]
    pub bounce_processing: bool,

    /// Bounce score at which a member's delivery is disabled
    #[serde(default = "default_bounce_score_threshold")]
    pub bounce_score_threshold: f64,

    /// A member's bounce score is reset when the previous bounce is older
    /// than this
    #[serde(default = "default_bounce_info_stale_after_secs")]
    pub bounce_info_stale_after_secs: u64,

    /// Stages for this list's postings, overriding the site default
    #[serde(default)]
    pub pipeline: Option<Vec<String>>,
}

impl ListConfig {
    #[must_use]
    pub fn new(name: &str, host: &str) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            preferred_language: default_language(),
            owner: Vec::new(),
            moderator: Vec::new(),
            moderated: false,
            subject_prefix: None,
            digestable: default_true(),
            archive: default_true(),
            bounce_processing: default_true(),
            bounce_score_threshold: default_bounce_score_threshold(),
            bounce_info_stale_after_secs: default_bounce_info_stale_after_secs(),
            pipeline: None,
        }
    }

    /// `<name>@<host>`
    pub fn posting_address(&self) -> String {
        format!("{}@{}", self.name, self.host)
    }

    /// `<name>-<extra>@<host>`, e.g. the `-bounces` or `-owner` address
    pub fn extended_address(&self, extra: &str) -> String {
        format!("{}-{extra}@{}", self.name, self.host)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: ListConfig =
            serde_json::from_str(r#"{"name": "x", "host": "lists.example.com"}"#)
                .expect("minimal config");

        assert_eq!(config, ListConfig::new("x", "lists.example.com"));
        assert!(config.bounce_processing);
        assert_eq!(config.preferred_language, "en");
    }

    #[test]
    fn test_addresses() {
        let config = ListConfig::new("x", "lists.example.com");
        assert_eq!(config.posting_address(), "x@lists.example.com");
        assert_eq!(config.extended_address("bounces"), "x-bounces@lists.example.com");
    }
}
