//! Filesystem key store.
//!
//! Key material is content-addressed by the lowercase hex MD5 digest of the
//! exact address bytes:
//!
//! | File | Content |
//! |---|---|
//! | `<hash>.pgp` | armored public key |
//! | `<hash>.privpgp` | armored private key |
//! | `<hash>.config` | policy document |
//!
//! The digest only selects a file name. It is not part of the trust
//! boundary: anyone who can write into the key directory controls the
//! keys, whatever the hash.

use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::debug;

use crate::error::KeyStoreError;

/// Default key directory.
pub const DEFAULT_KEY_DIR: &str = "/keys";

/// Per-address policy document. Opaque apart from trigger containment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDocument(Vec<u8>);

impl PolicyDocument {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self(content.into())
    }

    /// Does the document contain `trigger`? An empty trigger never matches.
    pub fn contains_trigger(&self, trigger: &str) -> bool {
        let needle = trigger.as_bytes();
        if needle.is_empty() || needle.len() > self.0.len() {
            return false;
        }
        self.0.windows(needle.len()).any(|w| w == needle)
    }
}

/// Key material resolved for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub public_key: Vec<u8>,
    pub private_key: Option<Vec<u8>>,
    pub policy: Option<PolicyDocument>,
}

/// Read-only resolver of key material.
pub trait KeyStore: Send + Sync {
    /// Resolve an address. `None` means no public key: send unencrypted.
    fn lookup(&self, address: &str) -> Result<Option<KeyMaterial>, KeyStoreError>;

    /// Resolve only the private (signing) key of an address.
    fn private_key(&self, address: &str) -> Result<Option<Vec<u8>>, KeyStoreError>;
}

/// Lowercase hex MD5 digest of the address bytes.
pub fn address_hash(address: &str) -> String {
    format!("{:x}", md5::compute(address.as_bytes()))
}

/// Key store backed by a flat directory.
#[derive(Debug, Clone)]
pub struct FsKeyStore {
    dir: PathBuf,
}

impl FsKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the `<hash>.<ext>` file for an address.
    pub fn path_for(&self, address: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", address_hash(address)))
    }

    fn read_optional(&self, path: PathBuf) -> Result<Option<Vec<u8>>, KeyStoreError> {
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Key file not found");
                Ok(None)
            }
            Err(source) => Err(KeyStoreError::Read { path, source }),
        }
    }
}

impl KeyStore for FsKeyStore {
    fn lookup(&self, address: &str) -> Result<Option<KeyMaterial>, KeyStoreError> {
        let Some(public_key) = self.read_optional(self.path_for(address, "pgp"))? else {
            return Ok(None);
        };
        let policy = self
            .read_optional(self.path_for(address, "config"))?
            .map(PolicyDocument::new);
        let private_key = self.read_optional(self.path_for(address, "privpgp"))?;

        Ok(Some(KeyMaterial {
            public_key,
            private_key,
            policy,
        }))
    }

    fn private_key(&self, address: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        self.read_optional(self.path_for(address, "privpgp"))
    }
}
