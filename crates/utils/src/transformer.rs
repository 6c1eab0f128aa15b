//! In-pipeline cryptographic message transformations.
//!
//! Transformers run between the caller handing over a message and the
//! transport receiving it. Each one rewrites the content of an
//! [`EmailMessage`] in place; a failing transformer leaves the message as
//! it found it. Concrete implementations are
//! [`SmimeSigner`](crate::SmimeSigner) and
//! [`SmimeEncryptor`](crate::SmimeEncryptor), chained by
//! [`SmimeMailer`](crate::SmimeMailer).

use crate::{EmailMessage, SmimeResult};

/// Trait for transformers that rewrite messages before dispatch.
pub trait MessageTransformer: Send + Sync {
    /// Transforms an email message in place.
    fn transform(&self, message: &mut EmailMessage) -> SmimeResult<()>;

    /// Returns the name of this transformer.
    fn name(&self) -> &str;
}
