//! Mailing list state as the queue runners see it.
//!
//! A [`MailList`] is opened from a [`ListStore`] by name, locked with a
//! bounded wait before any change, and saved and unlocked afterwards.

pub mod bounce;
pub mod config;
pub mod error;
pub mod list;
pub mod lock;
pub mod membership;
pub mod store;

pub use bounce::{BounceInfo, BounceOutcome, BounceRegistry};
pub use config::ListConfig;
pub use error::{ListError, LockError, Result};
pub use list::MailList;
pub use membership::{Member, Membership};
pub use store::ListStore;
