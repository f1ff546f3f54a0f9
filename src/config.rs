//! Relay configuration.
//!
//! Built once at startup from the environment (plus command-line overrides
//! applied in `main`) and shared read-only through an `Arc`.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::delivery::SmartHostConfig;
use crate::error::ConfigError;
use crate::keystore::DEFAULT_KEY_DIR;
use crate::selector::{RecipientMode, TriggerMode};

/// Process-wide, immutable relay configuration.
#[derive(Debug)]
pub struct RelayConfig {
    /// Key store directory.
    pub key_dir: PathBuf,
    /// Sender-domain allow-list. Empty allows every sender.
    pub allowed_domains: Vec<String>,
    /// Envelope sender override (`-f`).
    pub sender: Option<String>,
    /// Subject override (`-s`).
    pub subject: Option<String>,
    /// Identity whose private key signs outgoing mail.
    pub signing_identity: Option<String>,
    /// Passphrase unlocking the signing key.
    pub passphrase: SecretString,
    pub recipient_mode: RecipientMode,
    /// Encrypt inbound subject matches twice.
    pub inbound_double_wrap: bool,
    /// Attach result fields to delivery logs.
    pub verbose: bool,
    /// Smart host. `None` delivers directly to recipient domains.
    pub smart_host: Option<SmartHostConfig>,
    pub smtp: SmtpListenerConfig,
    pub http: HttpListenerConfig,
}

/// SMTP listener settings.
#[derive(Debug, Clone)]
pub struct SmtpListenerConfig {
    pub bind: String,
    /// Name announced in the greeting.
    pub hostname: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl Default for SmtpListenerConfig {
    fn default() -> Self {
        Self {
            bind: "localhost:25".to_string(),
            hostname: "localhost".to_string(),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024,
            max_recipients: 50,
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Default)]
pub struct HttpListenerConfig {
    pub bind: String,
    /// Required value of the `Token` request header, if set.
    pub token: Option<SecretString>,
}

impl HttpListenerConfig {
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            token: None,
        }
    }
}

impl RelayConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let key_dir = var("SENDMAIL_KEY_DIR")
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_KEY_DIR.to_string());

        let signing_identity = var("SENDMAIL_SMART_LOGIN").filter(|s| !s.is_empty());
        let passphrase = SecretString::from(var("SENDMAIL_SECRET").unwrap_or_default());

        let allowed_domains: Vec<String> = var("SENDMAIL_SENDER_DOMAINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let smart_host = SmartHostConfig::from_lookup(&var)?;

        Ok(Self {
            key_dir: PathBuf::from(key_dir),
            allowed_domains,
            sender: None,
            subject: None,
            signing_identity,
            passphrase,
            recipient_mode: RecipientMode::default(),
            inbound_double_wrap: true,
            verbose: false,
            smart_host,
            smtp: SmtpListenerConfig::default(),
            http: HttpListenerConfig::new("localhost:8080"),
        })
    }

    /// Identity whose private key signs outgoing mail. Only the configured
    /// signing identity qualifies: message senders are client-supplied and
    /// never select a key.
    pub fn signer(&self) -> Option<&str> {
        self.signing_identity.as_deref().filter(|s| !s.is_empty())
    }

    /// Trigger policy of the command-submission path.
    pub fn submit_trigger(&self) -> TriggerMode {
        TriggerMode::StaticMarker
    }

    /// Trigger policy of the inbound relay path.
    pub fn relay_trigger(&self) -> TriggerMode {
        TriggerMode::SubjectMatch {
            double_wrap: self.inbound_double_wrap,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config(&[]).unwrap();
        assert_eq!(config.key_dir, PathBuf::from("/keys"));
        assert!(config.allowed_domains.is_empty());
        assert!(config.signing_identity.is_none());
        assert_eq!(config.passphrase.expose_secret(), "");
        assert!(config.smart_host.is_none());
        assert!(config.inbound_double_wrap);
        assert_eq!(config.recipient_mode, RecipientMode::FirstRecipient);
        assert_eq!(config.smtp.max_recipients, 50);
        assert_eq!(config.smtp.max_message_bytes, 1024 * 1024);
        assert_eq!(config.http.bind, "localhost:8080");
    }

    #[test]
    fn reads_identity_secret_and_domains() {
        let config = config(&[
            ("SENDMAIL_KEY_DIR", "/tmp/keys"),
            ("SENDMAIL_SMART_LOGIN", "alice@example.com"),
            ("SENDMAIL_SECRET", "hunter2"),
            ("SENDMAIL_SENDER_DOMAINS", "example.com, example.org ,"),
        ])
        .unwrap();
        assert_eq!(config.key_dir, PathBuf::from("/tmp/keys"));
        assert_eq!(config.signing_identity.as_deref(), Some("alice@example.com"));
        assert_eq!(config.passphrase.expose_secret(), "hunter2");
        assert_eq!(config.allowed_domains, ["example.com", "example.org"]);
    }

    #[test]
    fn smart_host_from_environment() {
        let config = config(&[
            ("SENDMAIL_SMART_HOST", "smtp.example.com"),
            ("SENDMAIL_SMART_PORT", "465"),
            ("SENDMAIL_SMART_LOGIN", "alice@example.com"),
            ("SENDMAIL_SMART_PASSWORD", "pw"),
        ])
        .unwrap();
        let smart = config.smart_host.unwrap();
        assert_eq!(smart.host, "smtp.example.com");
        assert_eq!(smart.port, 465);
        assert_eq!(smart.username, "alice@example.com");
        assert_eq!(smart.password.expose_secret(), "pw");
    }

    #[test]
    fn invalid_smart_port_is_rejected() {
        let err = config(&[
            ("SENDMAIL_SMART_HOST", "smtp.example.com"),
            ("SENDMAIL_SMART_PORT", "smtp"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "SENDMAIL_SMART_PORT"
        ));
    }

    #[test]
    fn signer_is_the_signing_identity_only() {
        let mut config = config(&[]).unwrap();
        assert_eq!(config.signer(), None);

        config.sender = Some("alice@example.com".into());
        assert_eq!(config.signer(), None);

        config.signing_identity = Some("relay@example.com".into());
        assert_eq!(config.signer(), Some("relay@example.com"));

        config.signing_identity = Some(String::new());
        assert_eq!(config.signer(), None);
    }

    #[test]
    fn trigger_policies_follow_wrap_setting() {
        let mut config = config(&[]).unwrap();
        assert_eq!(config.submit_trigger(), TriggerMode::StaticMarker);
        assert_eq!(config.relay_trigger(), TriggerMode::SubjectMatch { double_wrap: true });

        config.inbound_double_wrap = false;
        assert_eq!(config.relay_trigger(), TriggerMode::SubjectMatch { double_wrap: false });
    }
}
