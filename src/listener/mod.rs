//! Network ingestion: SMTP and HTTP front ends over the shared pipeline.

pub mod http;
pub mod smtp;

pub use http::{http_routes, serve_http};
pub use smtp::{run_smtp, serve_smtp};
