//! Shared types for the message pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delivery::DeliveryOutcome;

// ── Submission ──────────────────────────────────────────────────────

/// A message handed in on the command-submission path (stdin, HTTP).
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// Explicit sender. Falls back to the configured identity, the
    /// message's `From`, then `user@hostname`.
    pub sender: Option<String>,
    /// Explicit recipients. Empty means "read To/Cc/Bcc from the message".
    pub recipients: Vec<String>,
    /// Subject override for unencrypted mail.
    pub subject: Option<String>,
    /// Raw message bytes, with or without a header block.
    pub body: Vec<u8>,
}

// ── Inbound message ─────────────────────────────────────────────────

/// A message received by the SMTP listener.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Generated per message, used to correlate log lines.
    pub id: Uuid,
    /// `MAIL FROM` reverse path.
    pub sender: String,
    /// `RCPT TO` forward paths in the order received.
    pub recipients: Vec<String>,
    /// Dot-unstuffed `DATA` payload.
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(sender: impl Into<String>, recipients: Vec<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipients,
            data,
            received_at: Utc::now(),
        }
    }
}

// ── Report ──────────────────────────────────────────────────────────

/// What happened to one message: one entry per envelope sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageReport {
    pub envelopes: Vec<EnvelopeReport>,
}

/// Delivery summary of one envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvelopeReport {
    pub recipients: Vec<String>,
    pub encrypted: bool,
    pub results: usize,
    pub warnings: usize,
}

impl EnvelopeReport {
    pub fn new(recipients: Vec<String>, encrypted: bool, outcome: DeliveryOutcome) -> Self {
        Self {
            recipients,
            encrypted,
            results: outcome.results,
            warnings: outcome.warnings,
        }
    }
}
