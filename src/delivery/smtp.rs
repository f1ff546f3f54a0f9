//! SMTP transports: smart-host relay and direct delivery, via lettre.
//!
//! lettre's `SmtpTransport` is blocking, so each dispatch runs on
//! `spawn_blocking` and reports through the result channel. A closed
//! channel (the reporter aborted) stops the remaining attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::address::Envelope as SmtpEnvelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{DeliveryResult, Dispatcher, ResultStream, result_channel};
use crate::address::{domain_of, parse_address_list};
use crate::envelope::Envelope;
use crate::error::{ConfigError, DeliveryError};

/// Per-connection SMTP timeout.
const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Port of direct (MTA to MTA) delivery.
const DIRECT_PORT: u16 = 25;

// ── Configuration ───────────────────────────────────────────────────

/// Smart-host relay configuration.
#[derive(Debug)]
pub struct SmartHostConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

impl SmartHostConfig {
    /// Read `SENDMAIL_SMART_*` variables from `var`.
    /// Returns `None` if `SENDMAIL_SMART_HOST` is not set (direct delivery).
    pub fn from_lookup(var: &dyn Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(host) = var("SENDMAIL_SMART_HOST").filter(|h| !h.is_empty()) else {
            return Ok(None);
        };

        let port: u16 = match var("SENDMAIL_SMART_PORT") {
            Some(raw) => {
                raw.parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                        key: "SENDMAIL_SMART_PORT".to_string(),
                        message: e.to_string(),
                    })?
            }
            None => 587,
        };

        let username = var("SENDMAIL_SMART_LOGIN").unwrap_or_default();
        let password = var("SENDMAIL_SMART_PASSWORD").unwrap_or_default();

        Ok(Some(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
        }))
    }
}

// ── Relay ───────────────────────────────────────────────────────────

/// Sends every envelope through one authenticated smart host.
pub struct RelayDispatcher {
    host: String,
    port: u16,
    username: String,
    password: SecretString,
}

impl RelayDispatcher {
    pub fn new(config: &SmartHostConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: SecretString::from(config.password.expose_secret().to_owned()),
        }
    }

    fn transport(&self) -> Result<SmtpTransport, DeliveryError> {
        let builder = if self.port == 465 {
            SmtpTransport::relay(&self.host)
        } else {
            SmtpTransport::starttls_relay(&self.host)
        }
        .map_err(|e| DeliveryError::Transport {
            host: self.host.clone(),
            reason: e.to_string(),
        })?
        .port(self.port)
        .timeout(Some(SMTP_TIMEOUT));

        let builder = if self.username.is_empty() {
            builder
        } else {
            builder.credentials(Credentials::new(
                self.username.clone(),
                self.password.expose_secret().to_string(),
            ))
        };
        Ok(builder.build())
    }
}

#[async_trait]
impl Dispatcher for RelayDispatcher {
    fn name(&self) -> &str {
        "relay"
    }

    async fn send(&self, envelope: Envelope) -> ResultStream {
        let (tx, stream) = result_channel();
        let transport = self.transport();
        let host = self.host.clone();

        tokio::task::spawn_blocking(move || {
            let result = match transport {
                Ok(transport) => relay_once(&transport, &host, &envelope),
                Err(e) => DeliveryResult::fatal("Smart host unavailable")
                    .with_field("host", host.as_str())
                    .with_error(e),
            };
            let _ = tx.blocking_send(result);
        });

        stream
    }
}

fn relay_once(transport: &SmtpTransport, host: &str, envelope: &Envelope) -> DeliveryResult {
    let recipients = envelope.recipients().join(",");
    let prepared = match prepare(envelope, envelope.recipients()) {
        Ok(prepared) => prepared,
        Err(e) => {
            return DeliveryResult::fatal("Cannot prepare message")
                .with_field("recipients", recipients)
                .with_error(e);
        }
    };

    match transport.send_raw(&prepared.envelope, &prepared.data) {
        Ok(_) => DeliveryResult::info(format!("Message relayed via {host}"))
            .with_field("host", host)
            .with_field("recipients", recipients),
        Err(e) => DeliveryResult::fatal(format!("Relay via {host} failed"))
            .with_field("host", host)
            .with_field("recipients", recipients)
            .with_error(DeliveryError::Send(e.to_string())),
    }
}

// ── Direct ──────────────────────────────────────────────────────────

/// Delivers straight to each recipient domain's mail host on port 25.
///
/// The domain itself is used as the mail host (implicit MX); there is no
/// MX lookup. One result per domain.
#[derive(Debug, Clone)]
pub struct DirectDispatcher {
    port: u16,
}

impl DirectDispatcher {
    pub fn new() -> Self {
        Self { port: DIRECT_PORT }
    }

    /// Deliver to a non-standard port (tests, local relays).
    pub fn with_port(port: u16) -> Self {
        Self { port }
    }
}

impl Default for DirectDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    fn name(&self) -> &str {
        "direct"
    }

    async fn send(&self, envelope: Envelope) -> ResultStream {
        let (tx, stream) = result_channel();
        let port = self.port;
        tokio::task::spawn_blocking(move || deliver_direct(&envelope, port, &tx));
        stream
    }
}

/// Relay through the smart host when one is configured, otherwise deliver
/// directly. Direct delivery does no MX lookup, so its selection is logged
/// as a warning.
pub fn dispatcher_for(smart_host: Option<&SmartHostConfig>) -> Arc<dyn Dispatcher> {
    match smart_host {
        Some(config) => Arc::new(RelayDispatcher::new(config)),
        None => {
            warn!(
                "No smart host configured (SENDMAIL_SMART_HOST); delivering straight to \
                 recipient domains on port 25, which most providers reject"
            );
            Arc::new(DirectDispatcher::new())
        }
    }
}

fn deliver_direct(envelope: &Envelope, port: u16, tx: &mpsc::Sender<DeliveryResult>) {
    let (groups, invalid) = group_by_domain(envelope.recipients());

    for address in invalid {
        let result = DeliveryResult::warn(format!("Skipping invalid recipient {address}"))
            .with_field("recipient", address);
        if tx.blocking_send(result).is_err() {
            return;
        }
    }

    for (domain, recipients) in groups {
        debug!(%domain, recipients = recipients.len(), "Delivering directly");
        let result = deliver_to_domain(envelope, &domain, &recipients, port);
        if tx.blocking_send(result).is_err() {
            debug!("Result stream closed, stopping delivery");
            return;
        }
    }
}

fn deliver_to_domain(
    envelope: &Envelope,
    domain: &str,
    recipients: &[String],
    port: u16,
) -> DeliveryResult {
    let joined = recipients.join(",");
    let attempt = || -> Result<(), DeliveryError> {
        let prepared = prepare(envelope, recipients)?;
        let tls = TlsParameters::new(domain.to_string()).map_err(|e| DeliveryError::Transport {
            host: domain.to_string(),
            reason: e.to_string(),
        })?;
        let transport = SmtpTransport::builder_dangerous(domain)
            .port(port)
            .tls(Tls::Opportunistic(tls))
            .timeout(Some(SMTP_TIMEOUT))
            .build();
        transport
            .send_raw(&prepared.envelope, &prepared.data)
            .map_err(|e| DeliveryError::Send(e.to_string()))?;
        Ok(())
    };

    match attempt() {
        Ok(()) => DeliveryResult::info(format!("Message sent to {domain}"))
            .with_field("domain", domain)
            .with_field("recipients", joined),
        Err(e) => DeliveryResult::fatal(format!("Delivery to {domain} failed"))
            .with_field("domain", domain)
            .with_field("recipients", joined)
            .with_error(e),
    }
}

/// Group recipients by domain in order of first appearance. Addresses
/// without a usable domain are returned separately.
pub fn group_by_domain(recipients: &[String]) -> (Vec<(String, Vec<String>)>, Vec<String>) {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    let mut invalid = Vec::new();

    for recipient in recipients {
        let domain = domain_of(recipient);
        if domain.is_empty() {
            invalid.push(recipient.clone());
            continue;
        }
        match groups.iter_mut().find(|(d, _)| d.eq_ignore_ascii_case(domain)) {
            Some((_, list)) => list.push(recipient.clone()),
            None => groups.push((domain.to_string(), vec![recipient.clone()])),
        }
    }

    (groups, invalid)
}

// ── Shared ──────────────────────────────────────────────────────────

struct Prepared {
    envelope: SmtpEnvelope,
    data: Vec<u8>,
}

/// SMTP envelope (reverse path + forward paths) and wire bytes.
fn prepare(envelope: &Envelope, recipients: &[String]) -> Result<Prepared, DeliveryError> {
    let from = envelope
        .sender()
        .and_then(|from| parse_address_list(from).and_then(|list| list.into_iter().next()))
        .map(|from| parse_smtp_address(&from))
        .transpose()?;

    let to = recipients
        .iter()
        .map(|r| parse_smtp_address(r))
        .collect::<Result<Vec<_>, _>>()?;

    let smtp_envelope = SmtpEnvelope::new(from, to).map_err(|e| DeliveryError::InvalidAddress {
        address: recipients.join(","),
        reason: e.to_string(),
    })?;

    let data = envelope
        .to_bytes()
        .map_err(|e| DeliveryError::Send(e.to_string()))?;

    Ok(Prepared {
        envelope: smtp_envelope,
        data,
    })
}

fn parse_smtp_address(address: &str) -> Result<Address, DeliveryError> {
    address
        .parse::<Address>()
        .map_err(|e| DeliveryError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}
