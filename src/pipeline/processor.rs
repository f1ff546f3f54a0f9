//! Message processor: one message from raw input to drained delivery results.
//!
//! Two entry points share one flow and differ only in trigger policy:
//! - `submit()`: command submission (stdin, HTTP), `TriggerMode::StaticMarker`
//! - `relay()`: inbound SMTP, `TriggerMode::SubjectMatch`
//!
//! Any error ends the current message only. Callers decide what that means
//! for their session (exit code, SMTP reply, HTTP status).

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::crypto::PgpEngine;
use crate::delivery::{Dispatcher, ResultReporter};
use crate::envelope::{
    ENCRYPTED_SUBJECT_MARKER, Envelope, EnvelopeConfig, resolve_recipients, resolve_sender,
};
use crate::error::{InputError, Result};
use crate::guard;
use crate::keystore::KeyStore;
use crate::message::parse_message;
use crate::pipeline::types::{EnvelopeReport, InboundMessage, MessageReport, Submission};
use crate::selector::{EncryptionSelector, RecipientDecision, TriggerMode};

/// Wires validation, authorization, encryption, envelope assembly and
/// delivery for one message at a time. Shared across tasks via `Arc`.
pub struct Pipeline {
    config: Arc<RelayConfig>,
    selector: EncryptionSelector,
    dispatcher: Arc<dyn Dispatcher>,
    reporter: ResultReporter,
}

/// Everything `process` needs once a message has been validated.
struct Prepared {
    sender: Option<String>,
    /// Sender resolved from the message itself. Used as `From` when the
    /// original headers disappear inside an encrypted body.
    resolved_sender: String,
    signer: Option<String>,
    recipients: Vec<String>,
    trigger_subject: Option<String>,
    subject: Option<String>,
    body: Vec<u8>,
    mode: TriggerMode,
}

impl Pipeline {
    pub fn new(
        config: Arc<RelayConfig>,
        keys: Arc<dyn KeyStore>,
        pgp: Arc<dyn PgpEngine>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let passphrase = SecretString::from(config.passphrase.expose_secret().to_owned());
        let selector = EncryptionSelector::new(keys, pgp, passphrase);
        let reporter = ResultReporter::new(config.verbose);
        Self {
            config,
            selector,
            dispatcher,
            reporter,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Sender-domain check against the configured allow-list.
    pub fn authorize(&self, sender: &str) -> Result<()> {
        guard::authorize(sender, &self.config.allowed_domains)?;
        Ok(())
    }

    /// Command-submission path.
    pub async fn submit(&self, submission: Submission) -> Result<MessageReport> {
        let Submission {
            sender,
            recipients,
            subject,
            body,
        } = submission;

        if body.is_empty() {
            return Err(InputError::EmptyBody.into());
        }
        let recipients = resolve_recipients(&recipients, &body);
        if recipients.is_empty() {
            return Err(InputError::EmptyRecipients.into());
        }

        let sender = sender
            .filter(|s| !s.is_empty())
            .or_else(|| self.config.sender.clone())
            .or_else(|| self.config.signing_identity.clone());
        let resolved = resolve_sender(sender.as_deref(), &body).unwrap_or_default();
        self.authorize(&resolved)?;

        info!(
            sender = %resolved,
            recipients = recipients.len(),
            bytes = body.len(),
            "Processing submitted message"
        );

        self.process(Prepared {
            sender,
            resolved_sender: resolved,
            signer: self.config.signer().map(str::to_string),
            recipients,
            trigger_subject: None,
            subject: subject.or_else(|| self.config.subject.clone()),
            body,
            mode: self.config.submit_trigger(),
        })
        .await
    }

    /// Inbound SMTP path. The encryption trigger is the message's own
    /// subject.
    pub async fn relay(&self, message: InboundMessage) -> Result<MessageReport> {
        let InboundMessage {
            id,
            sender,
            recipients,
            data,
            ..
        } = message;

        if data.is_empty() {
            return Err(InputError::EmptyBody.into());
        }
        let recipients = resolve_recipients(&recipients, &data);
        if recipients.is_empty() {
            return Err(InputError::EmptyRecipients.into());
        }
        self.authorize(&sender)?;

        let trigger_subject = parse_message(&data).and_then(|m| m.subject);

        info!(
            %id,
            %sender,
            recipients = recipients.len(),
            bytes = data.len(),
            subject = trigger_subject.as_deref().unwrap_or_default(),
            "Relaying inbound message"
        );

        self.process(Prepared {
            resolved_sender: sender.clone(),
            sender: Some(sender),
            signer: self.config.signer().map(str::to_string),
            recipients,
            trigger_subject,
            subject: self.config.subject.clone(),
            body: data,
            mode: self.config.relay_trigger(),
        })
        .await
    }

    async fn process(&self, prepared: Prepared) -> Result<MessageReport> {
        let Prepared {
            sender,
            resolved_sender,
            signer,
            recipients,
            trigger_subject,
            subject,
            body,
            mode,
        } = prepared;

        let decisions = self.selector.decide_all(
            &recipients,
            signer.as_deref(),
            trigger_subject.as_deref(),
            &body,
            mode,
            self.config.recipient_mode,
        )?;

        // Build every envelope before the first delivery attempt.
        let mut envelopes = Vec::with_capacity(decisions.len());
        for RecipientDecision {
            recipients,
            decision,
        } in decisions
        {
            let (sender, subject) = if decision.encrypted {
                let sender = sender
                    .clone()
                    .or_else(|| Some(resolved_sender.clone()).filter(|s| !s.is_empty()));
                (sender, Some(ENCRYPTED_SUBJECT_MARKER.to_string()))
            } else {
                (sender.clone(), subject.clone())
            };
            let envelope = Envelope::build(EnvelopeConfig {
                sender,
                recipients,
                subject,
                body: decision.body,
            })?;
            envelopes.push((envelope, decision.encrypted));
        }

        let mut report = MessageReport {
            envelopes: Vec::with_capacity(envelopes.len()),
        };
        for (envelope, encrypted) in envelopes {
            let recipients = envelope.recipients().to_vec();
            debug!(
                dispatcher = self.dispatcher.name(),
                recipients = %recipients.join(","),
                encrypted,
                "Dispatching envelope"
            );
            let stream = self.dispatcher.send(envelope).await;
            let outcome = self.reporter.drain(stream).await?;
            report
                .envelopes
                .push(EnvelopeReport::new(recipients, encrypted, outcome));
        }

        Ok(report)
    }
}
