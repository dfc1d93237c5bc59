use std::time::Duration;

use serde::Deserialize;

const fn default_sleep_secs() -> u64 {
    1
}

const fn default_lock_timeout_secs() -> u64 {
    10
}

const fn default_orphan_grace_secs() -> u64 {
    60 * 60
}

const fn default_reap_timeout_secs() -> u64 {
    30
}

const fn default_cache_lists() -> bool {
    true
}

/// Settings shared by every runner
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// How long to sleep after a scan that found nothing
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,

    /// How long to wait for a list lock before trying again later
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Half-written queue files older than this are removed at start up
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,

    /// How long to wait for outstanding child processes when stopping
    #[serde(default = "default_reap_timeout_secs")]
    pub reap_timeout_secs: u64,

    /// Keep list handles between messages
    #[serde(default = "default_cache_lists")]
    pub cache_lists: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sleep_secs: default_sleep_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
            reap_timeout_secs: default_reap_timeout_secs(),
            cache_lists: default_cache_lists(),
        }
    }
}

impl RunnerConfig {
    pub const fn sleep(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }

    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub const fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub const fn reap_timeout(&self) -> Duration {
        Duration::from_secs(self.reap_timeout_secs)
    }
}

fn default_site_list() -> String {
    "mailman".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

/// The site-wide list and the addresses derived from it
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Name of the list that receives site-wide mail
    #[serde(default = "default_site_list")]
    pub site_list: String,

    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_list: default_site_list(),
            host: default_host(),
        }
    }
}

impl SiteConfig {
    /// `<site>@<host>`, or `<site>-<extra>@<host>`
    pub fn address(&self, extra: Option<&str>) -> String {
        extra.map_or_else(
            || format!("{}@{}", self.site_list, self.host),
            |extra| format!("{}-{extra}@{}", self.site_list, self.host),
        )
    }

    pub fn owner_address(&self) -> String {
        self.address(Some("owner"))
    }

    /// Envelope sender for mail forwarded to the site owners; a bounce of
    /// that mail must not come back into the bounce queue
    pub fn loop_address(&self) -> String {
        self.address(Some("loop"))
    }

    /// Envelope sender for unrecognised bounces forwarded to list owners
    pub fn admin_address(&self) -> String {
        self.address(Some("admin"))
    }

    pub fn is_site_list(&self, name: &str) -> bool {
        self.site_list.eq_ignore_ascii_case(name)
    }
}
