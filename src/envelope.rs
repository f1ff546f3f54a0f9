//! Envelope builder: turns a submission into headers, body and a resolved
//! recipient list.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use tracing::debug;

use crate::address::{domain_of, parse_address_list};
use crate::error::EnvelopeError;
use crate::message::{HeaderName, Headers, parse_message};

/// Subject marker that switches the builder to PGP/MIME framing.
pub const ENCRYPTED_SUBJECT_MARKER: &str = "...";

/// Fixed multipart boundary of the PGP/MIME framing.
const PGP_MIME_BOUNDARY: &str = "ca4";

/// Input to [`Envelope::build`]. Built fresh per message and consumed once.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeConfig {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body: Vec<u8>,
}

/// A fully resolved message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub headers: Headers,
    pub body: Vec<u8>,
    recipients: Vec<String>,
}

impl Envelope {
    /// Build an envelope.
    ///
    /// Sender precedence: explicit sender, then the message's `From`, then
    /// `user@hostname`. Recipient precedence: the explicit list, then the
    /// `To`, `Cc` and `Bcc` headers.
    pub fn build(config: EnvelopeConfig) -> Result<Self, EnvelopeError> {
        let EnvelopeConfig {
            sender,
            recipients,
            subject,
            body,
        } = config;
        let sender = sender.filter(|s| !s.is_empty());

        let parsed = match parse_message(&body) {
            Some(parsed) => parsed,
            None if !recipients.is_empty() => {
                let raw = synthesize(sender.as_deref(), &recipients, subject.as_deref(), &body);
                parse_message(&raw).ok_or_else(|| {
                    EnvelopeError::Parse("synthesized message has no header block".into())
                })?
            }
            None => {
                return Err(EnvelopeError::Parse(
                    "body has no header block and no recipients were given".into(),
                ));
            }
        };
        let mut headers = parsed.headers;

        match sender {
            Some(sender) => headers.set(HeaderName::From, sender),
            None if headers.contains(&HeaderName::From) => {}
            None => {
                if let Some(fallback) = local_sender() {
                    debug!(sender = %fallback, "No sender given, using local identity");
                    headers.set(HeaderName::From, fallback);
                }
            }
        }

        if let Some(subject) = subject.filter(|s| !s.is_empty()) {
            headers.set(HeaderName::Subject, encode_subject(&subject));
        }

        let recipients = if !recipients.is_empty() {
            // A malformed explicit list degrades to "no recipients".
            parse_address_list(&recipients.join(",")).unwrap_or_default()
        } else {
            header_recipients(&headers)?
        };

        if recipients.is_empty() {
            return Err(EnvelopeError::EmptyRecipients);
        }

        Ok(Self {
            headers,
            body: parsed.body,
            recipients,
        })
    }

    /// Resolved recipient addresses. Never empty.
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// The `From` address, if any.
    pub fn sender(&self) -> Option<&str> {
        self.headers.get(&HeaderName::From)
    }

    /// Serialize for the wire: headers (without `Bcc`), blank line, body.
    ///
    /// Adds `Message-ID` and `Date` when missing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        if self.headers.is_empty() {
            return Err(EnvelopeError::EmptyHeader);
        }

        let mut headers = self.headers.clone();
        let message_id = HeaderName::Other("Message-ID".into());
        if !headers.contains(&message_id) {
            let domain = self.sender().map(domain_of).unwrap_or_default();
            let domain = if domain.is_empty() { "localhost" } else { domain };
            headers.set(message_id, generate_message_id(domain));
        }
        let date = HeaderName::Other("Date".into());
        if !headers.contains(&date) {
            headers.set(date, chrono::Utc::now().to_rfc2822());
        }

        let mut out = Vec::with_capacity(self.body.len() + 512);
        for (name, value) in headers.iter() {
            if *name == HeaderName::Bcc {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

/// Build a minimal message around a raw body.
///
/// The subject marker produces `multipart/encrypted` PGP/MIME framing with
/// the (already armored) body as the octet-stream part.
fn synthesize(
    sender: Option<&str>,
    recipients: &[String],
    subject: Option<&str>,
    body: &[u8],
) -> Vec<u8> {
    let to = recipients.join(",");
    let mut buf = Vec::with_capacity(body.len() + 512);

    if subject == Some(ENCRYPTED_SUBJECT_MARKER) {
        debug!("Encrypted subject marker found, using PGP/MIME framing");
        buf.extend_from_slice(b"MIME-Version: 1.0\r\n");
        buf.extend_from_slice(
            format!(
                "Content-Type: multipart/encrypted; boundary=\"{PGP_MIME_BOUNDARY}\"; \
                 protocol=\"application/pgp-encrypted\"\r\n"
            )
            .as_bytes(),
        );
        if let Some(sender) = sender {
            buf.extend_from_slice(format!("From: {sender}\r\n").as_bytes());
        }
        buf.extend_from_slice(format!("To: {to}\r\n").as_bytes());
        buf.extend_from_slice(format!("Subject: {ENCRYPTED_SUBJECT_MARKER}\r\n\r\n").as_bytes());
        buf.extend_from_slice(format!("--{PGP_MIME_BOUNDARY}\r\n").as_bytes());
        buf.extend_from_slice(b"Content-Type: application/pgp-encrypted\r\n\r\n");
        buf.extend_from_slice(b"Version: 1\r\n\r\n");
        buf.extend_from_slice(format!("--{PGP_MIME_BOUNDARY}\r\n").as_bytes());
        buf.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        buf.extend_from_slice(body);
        buf.extend_from_slice(b"\r\n\r\n");
        buf.extend_from_slice(format!("--{PGP_MIME_BOUNDARY}--\r\n").as_bytes());
        return buf;
    }

    if let Some(sender) = sender {
        buf.extend_from_slice(format!("From: {sender}\r\n").as_bytes());
    }
    buf.extend_from_slice(format!("To: {to}\r\n\r\n").as_bytes());
    buf.extend_from_slice(body);
    buf
}

/// `To`, then `Cc`, then `Bcc`. A malformed `To` is an error; malformed
/// `Cc`/`Bcc` values are skipped.
fn header_recipients(headers: &Headers) -> Result<Vec<String>, EnvelopeError> {
    let mut out = Vec::new();
    for value in headers.get_all(&HeaderName::To) {
        let parsed = parse_address_list(value)
            .ok_or_else(|| EnvelopeError::Parse(format!("invalid To header: {value}")))?;
        out.extend(parsed);
    }
    for name in [HeaderName::Cc, HeaderName::Bcc] {
        for value in headers.get_all(&name) {
            if let Some(parsed) = parse_address_list(value) {
                out.extend(parsed);
            }
        }
    }
    Ok(out)
}

/// RFC 2047 encoded word, UTF-8 / base64.
pub fn encode_subject(subject: &str) -> String {
    format!("=?UTF-8?B?{}?=", STANDARD.encode(subject.as_bytes()))
}

/// `<random@domain>` with 16 random bytes, url-safe base64, no padding.
pub fn generate_message_id(domain: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("<{}@{domain}>", URL_SAFE_NO_PAD.encode(bytes))
}

/// The sender address [`Envelope::build`] will settle on, resolved without
/// building. A `From` header with a display name yields its bare address.
pub fn resolve_sender(sender: Option<&str>, body: &[u8]) -> Option<String> {
    if let Some(sender) = sender.filter(|s| !s.is_empty()) {
        return Some(sender.to_string());
    }
    let from = parse_message(body)
        .and_then(|m| m.headers.get(&HeaderName::From).map(str::to_string));
    match from {
        Some(from) => Some(
            parse_address_list(&from)
                .and_then(|list| list.into_iter().next())
                .unwrap_or(from),
        ),
        None => local_sender(),
    }
}

/// The recipient list [`Envelope::build`] will settle on, resolved
/// without building. Empty when nothing usable is found.
pub fn resolve_recipients(recipients: &[String], body: &[u8]) -> Vec<String> {
    if !recipients.is_empty() {
        return parse_address_list(&recipients.join(",")).unwrap_or_default();
    }
    parse_message(body)
        .and_then(|m| header_recipients(&m.headers).ok())
        .unwrap_or_default()
}

/// `user@hostname` of the current process, if both are known.
fn local_sender() -> Option<String> {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|u| !u.is_empty())?;
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())?;
    Some(format!("{user}@{host}"))
}
