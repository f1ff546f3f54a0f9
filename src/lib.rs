//! pgp-sendmail: a sendmail-compatible relay that encrypts outgoing mail
//! with OpenPGP keys from a filesystem key store.

pub mod address;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod guard;
pub mod keystore;
pub mod listener;
pub mod message;
pub mod pipeline;
pub mod selector;

#[cfg(test)]
mod test_support;
