//! Delivery boundary: the dispatcher seam and the graded result protocol.
//!
//! A dispatcher takes one envelope and returns a stream of results, one per
//! delivery attempt or step. The stream closes when the dispatcher has no
//! more attempts to report.

pub mod reporter;
pub mod smtp;

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::envelope::Envelope;

pub use reporter::{DeliveryOutcome, ResultReporter};
pub use smtp::{DirectDispatcher, RelayDispatcher, SmartHostConfig, dispatcher_for};

/// Result severity. Ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Fatal,
    Warn,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fatal => "fatal",
            Self::Warn => "warn",
            Self::Info => "info",
        })
    }
}

/// Structured context attached to a result (recipient, host, ...).
pub type Fields = BTreeMap<String, String>;

/// Outcome of one delivery attempt or step.
#[derive(Debug)]
pub struct DeliveryResult {
    pub level: Severity,
    pub message: String,
    pub error: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub fields: Fields,
}

impl DeliveryResult {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(Severity::Warn, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, message)
    }

    fn new(level: Severity, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            error: None,
            fields: Fields::new(),
        }
    }

    pub fn with_error(mut self, error: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Lazy, ordered, finite stream of delivery results.
pub type ResultStream = Pin<Box<dyn Stream<Item = DeliveryResult> + Send>>;

/// Transport boundary. Implementations start delivery in the background
/// and report through the returned stream.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Start delivering `envelope`.
    async fn send(&self, envelope: Envelope) -> ResultStream;
}

/// Channel capacity between a dispatcher task and its result stream.
const RESULT_BUFFER: usize = 16;

/// Create a result channel: the sender goes to the producing task, the
/// stream to the caller. Dropping the sender closes the stream.
pub fn result_channel() -> (mpsc::Sender<DeliveryResult>, ResultStream) {
    let (tx, rx) = mpsc::channel(RESULT_BUFFER);
    (tx, Box::pin(ReceiverStream::new(rx)))
}
