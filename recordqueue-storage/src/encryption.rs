//! Payload encryption applied before records are stored.
//!
//! The storage only forwards keys and descriptors. Verifying delivered keys and sealing payloads
//! is up to the [`Encryptor`] implementation.

use std::fmt::Debug;
use std::sync::Mutex;

use bytes::Bytes;
use recordqueue_types::EncryptionInformation;

use crate::error::{Error, Result};

/// An encryption key as delivered by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedEncryptionKey {
    /// Identifier of the key.
    pub public_key_id: u64,
    /// The public key material.
    pub public_key: Bytes,
    /// Signature over the key, checked against the verification key.
    pub signature: Bytes,
}

/// Encrypts record payloads.
pub trait Encryptor: Debug + Send + Sync + 'static {
    /// Returns `true` if a key is available and payloads are encrypted.
    fn has_encryption_key(&self) -> bool;

    /// Encrypts `payload`, returning the stored bytes and their descriptor.
    fn encrypt(&self, payload: Bytes) -> Result<(Bytes, Option<EncryptionInformation>)>;

    /// Installs a newly delivered key.
    fn update_encryption_key(&self, key: SignedEncryptionKey) -> Result<()>;
}

/// Tags payloads with the current key without transforming them.
#[derive(Debug, Default)]
pub struct PassthroughEncryption {
    verification_key: Option<String>,
    current: Mutex<Option<SignedEncryptionKey>>,
}

impl PassthroughEncryption {
    /// Creates an encryptor that requires delivered keys to be signed if `verification_key` is
    /// set.
    pub fn new(verification_key: Option<String>) -> Self {
        Self {
            verification_key,
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<SignedEncryptionKey>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Encryptor for PassthroughEncryption {
    fn has_encryption_key(&self) -> bool {
        self.current().is_some()
    }

    fn encrypt(&self, payload: Bytes) -> Result<(Bytes, Option<EncryptionInformation>)> {
        let info = self.current().as_ref().map(|key| EncryptionInformation {
            public_key_id: key.public_key_id,
            encrypted_key: Bytes::new(),
        });
        Ok((payload, info))
    }

    fn update_encryption_key(&self, key: SignedEncryptionKey) -> Result<()> {
        if key.public_key.is_empty() {
            return Err(Error::InvalidArgument("empty encryption key".into()));
        }
        if self.verification_key.is_some() && key.signature.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "encryption key {} is not signed",
                key.public_key_id
            )));
        }

        tracing::info!(key_id = key.public_key_id, "installed encryption key");
        *self.current() = Some(key);
        Ok(())
    }
}
