//! Sendmail-compatible command line.

use std::io::{self, BufRead};
use std::path::PathBuf;

use clap::Parser;
use secrecy::SecretString;

use crate::config::RelayConfig;
use crate::pipeline::Submission;
use crate::selector::RecipientMode;

#[derive(Debug, Parser)]
#[command(
    name = "sendmail",
    about = "Sendmail-compatible relay that encrypts mail with OpenPGP",
    version
)]
pub struct Cli {
    /// Read recipients from the message headers (implied when none are given)
    #[arg(short = 't')]
    pub extract_recipients: bool,

    /// Do not treat a line with a single dot as the end of input
    #[arg(short = 'i')]
    pub ignore_dots: bool,

    /// Verbose logging
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Envelope sender address
    #[arg(short = 'f', value_name = "ADDRESS")]
    pub sender: Option<String>,

    /// Subject override
    #[arg(short = 's', value_name = "SUBJECT")]
    pub subject: Option<String>,

    /// Run the HTTP listener
    #[arg(long)]
    pub http: bool,

    #[arg(long, value_name = "ADDR", default_value = "localhost:8080")]
    pub http_bind: String,

    /// Require this value in the `Token` header of HTTP requests
    #[arg(long, value_name = "TOKEN")]
    pub http_token: Option<String>,

    /// Run the SMTP listener
    #[arg(long)]
    pub smtp: bool,

    #[arg(long, value_name = "ADDR", default_value = "localhost:25")]
    pub smtp_bind: String,

    /// Allowed sender domain (repeatable). Unset allows every domain
    #[arg(long = "sender-domain", value_name = "DOMAIN")]
    pub sender_domains: Vec<String>,

    /// Key store directory
    #[arg(long, value_name = "DIR")]
    pub key_dir: Option<PathBuf>,

    /// Decide encryption separately for every recipient
    #[arg(long)]
    pub per_recipient: bool,

    /// Encrypt inbound subject matches once instead of twice
    #[arg(long)]
    pub single_wrap: bool,

    /// Recipient addresses
    #[arg(value_name = "RECIPIENT")]
    pub recipients: Vec<String>,
}

impl Cli {
    /// Does this invocation run a listener instead of reading stdin?
    pub fn is_daemon(&self) -> bool {
        self.http || self.smtp
    }

    /// Apply command-line overrides on top of the environment config.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(dir) = &self.key_dir {
            config.key_dir = dir.clone();
        }
        if !self.sender_domains.is_empty() {
            config.allowed_domains = self.sender_domains.clone();
        }
        if self.sender.is_some() {
            config.sender = self.sender.clone();
        }
        if self.subject.is_some() {
            config.subject = self.subject.clone();
        }
        config.verbose |= self.verbose;
        if self.per_recipient {
            config.recipient_mode = RecipientMode::PerRecipient;
        }
        if self.single_wrap {
            config.inbound_double_wrap = false;
        }
        config.http.bind = self.http_bind.clone();
        if let Some(token) = &self.http_token {
            config.http.token = Some(SecretString::from(token.clone()));
        }
        config.smtp.bind = self.smtp_bind.clone();
    }

    /// The stdin message as a submission. Sender and subject come from the
    /// applied config.
    pub fn submission(&self, body: Vec<u8>) -> Submission {
        Submission {
            sender: None,
            recipients: self.recipients.clone(),
            subject: None,
            body,
        }
    }
}

/// Read a message from `reader`.
///
/// Unless `ignore_dots` is set, a line holding a single `.` ends the
/// message. A final line without a line ending is kept.
pub fn read_message<R: BufRead>(mut reader: R, ignore_dots: bool) -> io::Result<Vec<u8>> {
    let mut message = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if !ignore_dots && matches!(line.as_slice(), b".\n" | b".\r\n" | b".") {
            break;
        }
        message.extend_from_slice(&line);
    }
    Ok(message)
}
