//! Sender-domain allow-list.

use tracing::error;

use crate::address::domain_of;
use crate::error::AuthorizationError;

/// Check a sender against the allow-list.
///
/// - Empty list → every sender is allowed
/// - Otherwise the sender's domain must equal an entry exactly (case-sensitive)
pub fn authorize(sender: &str, allowed_domains: &[String]) -> Result<(), AuthorizationError> {
    if allowed_domains.is_empty() {
        return Ok(());
    }
    let domain = domain_of(sender);
    if allowed_domains.iter().any(|d| d == domain) {
        return Ok(());
    }
    error!("Attempt to unauthorized send with domain {domain}");
    Err(AuthorizationError::SenderDomain {
        domain: domain.to_string(),
    })
}
