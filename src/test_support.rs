//! Shared mocks for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::RelayConfig;
use crate::crypto::PgpEngine;
use crate::delivery::{DeliveryResult, Dispatcher, ResultStream};
use crate::envelope::Envelope;
use crate::error::{CryptoError, KeyStoreError};
use crate::keystore::{KeyMaterial, KeyStore, PolicyDocument};
use crate::pipeline::Pipeline;

/// In-memory key store that records every lookup.
#[derive(Default)]
pub struct MemoryKeys {
    pub material: Vec<(String, KeyMaterial)>,
    pub private: Vec<(String, Vec<u8>)>,
    pub lookups: Mutex<Vec<String>>,
}

impl KeyStore for MemoryKeys {
    fn lookup(&self, address: &str) -> Result<Option<KeyMaterial>, KeyStoreError> {
        self.lookups.lock().unwrap().push(address.to_string());
        Ok(self
            .material
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, m)| m.clone()))
    }

    fn private_key(&self, address: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        self.lookups.lock().unwrap().push(address.to_string());
        Ok(self
            .private
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, k)| k.clone()))
    }
}

/// Tags bodies instead of encrypting. The tag contains a space so the
/// result never parses as a header block.
pub struct TagEngine;

impl PgpEngine for TagEngine {
    fn encrypt(&self, public_key: &[u8], body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let tag = format!("<ENC {}>", String::from_utf8_lossy(public_key));
        Ok([tag.as_bytes(), body].concat())
    }

    fn encrypt_and_sign(
        &self,
        public_key: &[u8],
        private_key: &[u8],
        _passphrase: &SecretString,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let tag = format!(
            "<SIG {}><ENC {}>",
            String::from_utf8_lossy(private_key),
            String::from_utf8_lossy(public_key)
        );
        Ok([tag.as_bytes(), body].concat())
    }
}

/// Fails every operation.
pub struct FailingEngine;

impl PgpEngine for FailingEngine {
    fn encrypt(&self, _: &[u8], _: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Encrypt("broken".into()))
    }

    fn encrypt_and_sign(
        &self,
        _: &[u8],
        _: &[u8],
        _: &SecretString,
        _: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Sign("broken".into()))
    }
}

/// Records envelopes and replies with a fixed script of results.
#[derive(Default)]
pub struct ScriptedDispatcher {
    pub sent: Mutex<Vec<Envelope>>,
    pub fatal: bool,
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, envelope: Envelope) -> ResultStream {
        let recipients = envelope.recipients().join(",");
        self.sent.lock().unwrap().push(envelope);
        let results = if self.fatal {
            vec![DeliveryResult::fatal("refused").with_field("recipients", recipients)]
        } else {
            vec![
                DeliveryResult::info("sent").with_field("recipients", recipients),
                DeliveryResult::warn("slow host"),
            ]
        };
        Box::pin(futures::stream::iter(results))
    }
}

/// Configuration with every variable unset.
pub fn base_config() -> RelayConfig {
    RelayConfig::from_lookup(|_| None).unwrap()
}

pub fn key(public: &str, policy: Option<&str>) -> KeyMaterial {
    KeyMaterial {
        public_key: public.as_bytes().to_vec(),
        private_key: None,
        policy: policy.map(PolicyDocument::new),
    }
}

pub fn pipeline(
    config: RelayConfig,
    keys: MemoryKeys,
    dispatcher: ScriptedDispatcher,
) -> (Pipeline, Arc<MemoryKeys>, Arc<ScriptedDispatcher>) {
    let keys = Arc::new(keys);
    let dispatcher = Arc::new(dispatcher);
    let pipeline = Pipeline::new(
        Arc::new(config),
        keys.clone(),
        Arc::new(TagEngine),
        dispatcher.clone(),
    );
    (pipeline, keys, dispatcher)
}
