//! Message pipeline.
//!
//! Every message, whatever the ingestion mode, flows through:
//! 1. Input validation: non-empty body, at least one recipient
//! 2. `guard::authorize()` on the resolved sender
//! 3. `EncryptionSelector` with the entry point's trigger policy
//! 4. `Envelope::build()`, one envelope per recipient decision
//! 5. `Dispatcher::send()` drained by the `ResultReporter`
//!
//! Nothing touches the key store before steps 1 and 2 pass.

pub mod processor;
pub mod types;

pub use processor::Pipeline;
pub use types::{EnvelopeReport, InboundMessage, MessageReport, Submission};
