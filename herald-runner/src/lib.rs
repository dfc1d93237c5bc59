//! The herald queue runners.
//!
//! A [`Runner`] owns one queue slice and drives a [`Dispatcher`] over it:
//!
//! - [`IncomingRunner`] runs postings through the handler pipeline
//! - [`OutgoingRunner`] delivers them, retrying temporary failures
//! - [`BounceRunner`] turns returned mail into bounce scores
//! - [`ArchRunner`] archives postings

pub mod archive;
pub mod bounce;
pub mod cache;
pub mod children;
pub mod config;
pub mod error;
pub mod incoming;
pub mod outgoing;
pub mod pipeline;
pub mod runner;

pub use archive::{ArchRunner, ArchiveConfig, Archiver, ClobberPolicy, MboxArchiver};
pub use bounce::{BounceRunner, Bouncer, Verp};
pub use cache::ListCache;
pub use children::Children;
pub use config::{RunnerConfig, SiteConfig};
pub use error::RunnerError;
pub use incoming::IncomingRunner;
pub use outgoing::{
    Delivery, DeliveryOutcome, OutgoingConfig, OutgoingRunner, RetryPolicy, SendmailDelivery,
};
pub use pipeline::{Handler, HandlerRegistry, StageContext, Verdict, default_pipeline};
pub use runner::{Dispatcher, Disposition, Runner};
