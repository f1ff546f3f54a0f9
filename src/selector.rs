//! Encryption selector: decides whether, and how, a body gets encrypted.
//!
//! Flow per decision:
//! 1. No public key for the recipient → body unchanged
//! 2. Public key, no policy document → encrypt
//! 3. Public key and policy → encrypt only when the policy contains the trigger
//! 4. Encrypt: sign too when a signing identity is configured and has a
//!    private key in the store
//!
//! Crypto failures abort the message; nothing is retried or downgraded.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::crypto::PgpEngine;
use crate::envelope::ENCRYPTED_SUBJECT_MARKER;
use crate::error::Result;
use crate::keystore::{KeyStore, address_hash};

/// How the policy trigger is chosen. The two ingestion paths disagree and
/// both behaviors are kept as named policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Trigger is the literal marker `"..."`; one encryption pass.
    StaticMarker,
    /// Trigger is the message subject. On a match the body is encrypted
    /// twice in sequence when `double_wrap` is set.
    SubjectMatch { double_wrap: bool },
}

impl TriggerMode {
    fn trigger<'a>(&self, subject: Option<&'a str>) -> &'a str {
        match self {
            Self::StaticMarker => ENCRYPTED_SUBJECT_MARKER,
            Self::SubjectMatch { .. } => subject.unwrap_or_default(),
        }
    }

    fn passes_on_match(&self) -> usize {
        match self {
            Self::SubjectMatch { double_wrap: true } => 2,
            _ => 1,
        }
    }
}

/// Which recipients an encryption decision is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecipientMode {
    /// One decision keyed on the first recipient, applied to all of them.
    #[default]
    FirstRecipient,
    /// One decision per recipient.
    PerRecipient,
}

/// Result of one encryption decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub body: Vec<u8>,
    pub encrypted: bool,
}

/// A decision together with the recipients it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientDecision {
    pub recipients: Vec<String>,
    pub decision: Decision,
}

/// Policy engine over a key store and an OpenPGP engine.
pub struct EncryptionSelector {
    keys: Arc<dyn KeyStore>,
    pgp: Arc<dyn PgpEngine>,
    passphrase: SecretString,
}

impl EncryptionSelector {
    pub fn new(keys: Arc<dyn KeyStore>, pgp: Arc<dyn PgpEngine>, passphrase: SecretString) -> Self {
        Self {
            keys,
            pgp,
            passphrase,
        }
    }

    /// Decide for every recipient group according to `recipient_mode`.
    pub fn decide_all(
        &self,
        recipients: &[String],
        signer: Option<&str>,
        subject: Option<&str>,
        body: &[u8],
        mode: TriggerMode,
        recipient_mode: RecipientMode,
    ) -> Result<Vec<RecipientDecision>> {
        match recipient_mode {
            RecipientMode::FirstRecipient => {
                let Some(first) = recipients.first() else {
                    return Ok(Vec::new());
                };
                if recipients.len() > 1 {
                    warn!(
                        keyed_on = %first,
                        recipients = recipients.len(),
                        "Multiple recipients, encryption decision keyed on the first only"
                    );
                }
                let decision = self.decide(first, signer, subject, body, mode)?;
                Ok(vec![RecipientDecision {
                    recipients: recipients.to_vec(),
                    decision,
                }])
            }
            RecipientMode::PerRecipient => recipients
                .iter()
                .map(|recipient| {
                    let decision = self.decide(recipient, signer, subject, body, mode)?;
                    Ok(RecipientDecision {
                        recipients: vec![recipient.clone()],
                        decision,
                    })
                })
                .collect(),
        }
    }

    /// Decide for a single recipient.
    pub fn decide(
        &self,
        recipient: &str,
        signer: Option<&str>,
        subject: Option<&str>,
        body: &[u8],
        mode: TriggerMode,
    ) -> Result<Decision> {
        let hash = address_hash(recipient);
        let Some(material) = self.keys.lookup(recipient)? else {
            debug!(%recipient, %hash, "No public key found, skipping encryption");
            return Ok(Decision {
                body: body.to_vec(),
                encrypted: false,
            });
        };

        let passes = match &material.policy {
            None => {
                debug!(%recipient, %hash, "No policy document, encrypting everything");
                1
            }
            Some(policy) => {
                let trigger = mode.trigger(subject);
                if !policy.contains_trigger(trigger) {
                    debug!(
                        %recipient,
                        %hash,
                        %trigger,
                        "Trigger not in policy, sending unencrypted"
                    );
                    return Ok(Decision {
                        body: body.to_vec(),
                        encrypted: false,
                    });
                }
                info!(%recipient, %trigger, "Trigger found in policy, encrypting");
                mode.passes_on_match()
            }
        };

        let signing_key = match signer {
            Some(signer) => self.keys.private_key(signer)?,
            None => None,
        };
        let mut out = body.to_vec();
        for _ in 0..passes {
            out = self.encrypt_once(&material.public_key, signing_key.as_deref(), signer, &out)?;
        }

        Ok(Decision {
            body: out,
            encrypted: true,
        })
    }

    fn encrypt_once(
        &self,
        public_key: &[u8],
        signing_key: Option<&[u8]>,
        signer: Option<&str>,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let armored = match signing_key {
            Some(private_key) => {
                debug!(
                    signer = signer.unwrap_or_default(),
                    "Private key found, signing message"
                );
                self.pgp
                    .encrypt_and_sign(public_key, private_key, &self.passphrase, body)?
            }
            None => {
                debug!(
                    signer = signer.unwrap_or_default(),
                    "No signing key, skipping signing"
                );
                self.pgp.encrypt(public_key, body)?
            }
        };
        Ok(armored)
    }
}
