//! The herald queue directories.
//!
//! A [`Switchboard`] is one queue directory, or one hash slice of it when
//! several runners share the directory.

pub mod config;
pub mod error;
pub mod switchboard;
pub mod token;

pub use config::{QueueConfig, queues};
pub use error::{Result, SerializationError, SpoolError};
pub use switchboard::Switchboard;
pub use token::QueueToken;
