//! Drains a result stream and decides, per result, whether to continue.
//!
//! - above `Warn`: logged at info, keep draining
//! - `Warn`: logged as a warning, keep draining
//! - below `Warn`: logged as an error, the stream is dropped and the
//!   message aborts with `DeliveryError::Aborted`
//!
//! Aborting only ends the current message. Results already reported for
//! other recipients are not rolled back.

use futures::StreamExt;
use tracing::{error, info, warn};

use super::{DeliveryResult, ResultStream, Severity};
use crate::error::DeliveryError;

/// Summary of a fully drained result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryOutcome {
    /// Number of results seen.
    pub results: usize,
    /// Number of warnings among them.
    pub warnings: usize,
    /// Most severe level observed, `None` for an empty stream.
    pub worst: Option<Severity>,
}

/// Classifies delivery results by severity.
#[derive(Debug, Clone, Copy)]
pub struct ResultReporter {
    /// Attach result fields to log events.
    verbose: bool,
}

impl ResultReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Drain `stream` until it closes or a fatal result arrives.
    pub async fn drain(&self, mut stream: ResultStream) -> Result<DeliveryOutcome, DeliveryError> {
        let mut outcome = DeliveryOutcome::default();

        while let Some(result) = stream.next().await {
            outcome.results += 1;
            outcome.worst = Some(match outcome.worst {
                Some(worst) => worst.min(result.level),
                None => result.level,
            });

            let fields = self.render_fields(&result);
            match result.level {
                level if level > Severity::Warn => {
                    info!(fields = %fields, "{}", result.message);
                }
                Severity::Warn => {
                    outcome.warnings += 1;
                    warn!(fields = %fields, error = ?result.error, "{}", result.message);
                }
                level => {
                    error!(fields = %fields, error = ?result.error, "{}", result.message);
                    return Err(DeliveryError::Aborted {
                        level,
                        message: result.message,
                        source: result.error,
                    });
                }
            }
        }

        Ok(outcome)
    }

    fn render_fields(&self, result: &DeliveryResult) -> String {
        if !self.verbose {
            return String::new();
        }
        result
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
