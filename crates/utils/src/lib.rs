pub mod config;
pub mod credentials;
pub mod encryptor;
pub mod error;
pub mod mailer;
pub mod message;
pub mod mime;
pub mod signer;
pub mod transformer;
pub mod transport;
pub mod transports;

#[cfg(test)]
#[path = "../tests/common/mod.rs"]
mod testing;

pub use config::*;
pub use credentials::*;
pub use encryptor::*;
pub use error::*;
pub use mailer::*;
pub use message::*;
pub use mime::*;
pub use signer::*;
pub use transformer::*;
pub use transport::*;
pub use transports::*;
