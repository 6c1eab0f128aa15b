//! Concrete [`MailTransport`](crate::MailTransport) implementations.
//!
//! Contains [`FileTransport`] for writing `.eml` files, [`MemoryTransport`]
//! for tests and embedders that want to inspect what would be sent, and
//! [`SmtpTransport`] (feature-gated behind `smtp`) for SMTP submission.

pub mod file;
pub mod memory;
#[cfg(feature = "smtp")]
pub mod smtp;

pub use file::*;
pub use memory::*;
#[cfg(feature = "smtp")]
pub use smtp::*;
