//! Types shared by every herald queue runner: the in-memory [`Message`],
//! its open-ended [`Metadata`], the per-runner language scope and the
//! logging setup.

pub mod error;
pub mod i18n;
pub mod logging;
pub mod message;
pub mod metadata;

pub use error::MessageParseError;
pub use i18n::{LanguageScope, Translation};
pub use message::Message;
pub use metadata::Metadata;
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
