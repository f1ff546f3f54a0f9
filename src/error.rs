//! Error types for pgp-sendmail.

use std::path::PathBuf;

use crate::delivery::Severity;

/// Top-level error type for one message's trip through the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structural problems with the submitted message.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Empty message body")]
    EmptyBody,

    #[error("No recipients listed")]
    EmptyRecipients,
}

/// Sender-domain allow-list rejection.
#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    #[error("Unauthorized sender domain {domain:?}")]
    SenderDomain { domain: String },
}

/// Key store failures. A missing key file is never an error.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// OpenPGP failures. Always fatal for the message being processed.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Public key has no encryption-capable key")]
    NoEncryptionKey,

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Signing failed: {0}")]
    Sign(String),

    #[error("Armoring failed: {0}")]
    Armor(String),
}

/// Envelope construction errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("No recipients listed")]
    EmptyRecipients,

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("Empty header")]
    EmptyHeader,
}

/// Delivery errors surfaced by the transport or the result reporter.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery aborted ({level}): {message}")]
    Aborted {
        level: Severity,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Transport setup failed for {host}: {reason}")]
    Transport { host: String, reason: String },

    #[error("SMTP send failed: {0}")]
    Send(String),
}

/// Listener (SMTP/HTTP) plumbing errors.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server on {addr} stopped: {reason}")]
    Serve { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
