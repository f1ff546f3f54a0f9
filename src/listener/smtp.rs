//! Minimal SMTP submission listener.
//!
//! Speaks just enough of RFC 5321 for clients to hand over a message:
//! greeting, `EHLO`/`HELO`, `AUTH PLAIN` (accepted without checking),
//! `MAIL`, `RCPT`, `DATA`, `RSET`, `NOOP` and `QUIT`. The allow-list runs at
//! `MAIL FROM` time; each completed `DATA` goes through `Pipeline::relay`.
//!
//! One task per connection. A failed message is answered with `554` and
//! the session carries on. Every read is bounded: command lines at 1000
//! bytes, `DATA` at the configured message size.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::SmtpListenerConfig;
use crate::error::ListenerError;
use crate::pipeline::{InboundMessage, Pipeline};

/// Bind `addr` and accept connections until the listener fails.
pub async fn serve_smtp(pipeline: Arc<Pipeline>, addr: &str) -> Result<(), ListenerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(%addr, "SMTP listener started");
    run_smtp(listener, pipeline).await
}

/// Accept loop over an already bound listener.
pub async fn run_smtp(listener: TcpListener, pipeline: Arc<Pipeline>) -> Result<(), ListenerError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let pipeline = Arc::clone(&pipeline);
        let span = info_span!("smtp", session = %Uuid::new_v4(), %peer);
        tokio::spawn(
            async move {
                debug!("Connection accepted");
                if let Err(e) = handle_connection(stream, peer, pipeline).await {
                    debug!(error = %e, "Connection closed with error");
                }
            }
            .instrument(span),
        );
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Longest accepted command line, line ending included.
const MAX_COMMAND_LINE: usize = 1000;

/// Transaction state between `MAIL` and the end of `DATA`.
#[derive(Debug, Default)]
struct Transaction {
    from: Option<String>,
    recipients: Vec<String>,
}

impl Transaction {
    fn reset(&mut self) {
        self.from = None;
        self.recipients.clear();
    }
}

/// One command line off the wire.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Text(String),
    /// Longer than `MAX_COMMAND_LINE`. The rest of it has been discarded.
    TooLong,
    Closed,
}

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
) -> io::Result<()> {
    let limits = pipeline.config().smtp.clone();
    let wt = limits.write_timeout;
    let (read, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut tx = Transaction::default();

    let greeting = format!("{} ESMTP pgp-sendmail ready", limits.hostname);
    reply(&mut writer, wt, 220, &greeting).await?;

    loop {
        let line = match read_line(&mut reader, limits.read_timeout).await? {
            Line::Text(line) => line,
            Line::TooLong => {
                reply(&mut writer, wt, 500, "Line too long").await?;
                continue;
            }
            Line::Closed => {
                debug!(%peer, "Client hung up");
                return Ok(());
            }
        };
        let (verb, arg) = split_command(&line);

        match verb.as_str() {
            "EHLO" => {
                tx.reset();
                let lines = [
                    limits.hostname.clone(),
                    format!("SIZE {}", limits.max_message_bytes),
                    "8BITMIME".to_string(),
                    "AUTH PLAIN".to_string(),
                ];
                multiline_reply(&mut writer, wt, 250, &lines).await?;
            }
            "HELO" => {
                tx.reset();
                reply(&mut writer, wt, 250, &limits.hostname).await?;
            }
            "AUTH" => {
                let mut parts = arg.split_whitespace();
                let mechanism = parts.next().unwrap_or_default();
                if !mechanism.eq_ignore_ascii_case("PLAIN") {
                    reply(&mut writer, wt, 504, "Unrecognized authentication type").await?;
                    continue;
                }
                if parts.next().is_none() {
                    // Credentials follow on their own line.
                    reply(&mut writer, wt, 334, "").await?;
                    match read_line(&mut reader, limits.read_timeout).await? {
                        Line::Text(_) => {}
                        Line::TooLong => {
                            reply(&mut writer, wt, 500, "Line too long").await?;
                            continue;
                        }
                        Line::Closed => return Ok(()),
                    }
                }
                reply(&mut writer, wt, 235, "Authentication succeeded").await?;
            }
            "MAIL" => {
                let Some(from) = parse_path(arg, "FROM:") else {
                    reply(&mut writer, wt, 501, "Syntax: MAIL FROM:<address>").await?;
                    continue;
                };
                match pipeline.authorize(&from) {
                    Ok(()) => {
                        tx.reset();
                        tx.from = Some(from);
                        reply(&mut writer, wt, 250, "OK").await?;
                    }
                    Err(e) => {
                        warn!(%from, error = %e, "Sender rejected");
                        reply(&mut writer, wt, 550, "Sender domain not allowed").await?;
                    }
                }
            }
            "RCPT" => {
                if tx.from.is_none() {
                    reply(&mut writer, wt, 503, "Need MAIL before RCPT").await?;
                    continue;
                }
                let Some(to) = parse_path(arg, "TO:") else {
                    reply(&mut writer, wt, 501, "Syntax: RCPT TO:<address>").await?;
                    continue;
                };
                if tx.recipients.len() >= limits.max_recipients {
                    reply(&mut writer, wt, 452, "Too many recipients").await?;
                    continue;
                }
                tx.recipients.push(to);
                reply(&mut writer, wt, 250, "OK").await?;
            }
            "DATA" => {
                let Some(from) = tx.from.clone().filter(|_| !tx.recipients.is_empty()) else {
                    reply(&mut writer, wt, 503, "Need MAIL and RCPT before DATA").await?;
                    continue;
                };
                reply(&mut writer, wt, 354, "End data with <CR><LF>.<CR><LF>").await?;

                let data = match read_data(&mut reader, &limits).await? {
                    DataOutcome::Complete(data) => data,
                    DataOutcome::TooLarge => {
                        tx.reset();
                        reply(&mut writer, wt, 552, "Message exceeds size limit").await?;
                        continue;
                    }
                };

                let recipients = std::mem::take(&mut tx.recipients);
                tx.reset();
                let message = InboundMessage::new(from, recipients, data);
                let id = message.id;
                match pipeline.relay(message).await {
                    Ok(report) => {
                        info!(%id, envelopes = report.envelopes.len(), "Message relayed");
                        let text = format!("OK: queued as {id}");
                        reply(&mut writer, wt, 250, &text).await?;
                    }
                    Err(e) => {
                        warn!(%id, error = %e, "Message failed");
                        let text = format!("Transaction failed: {e}");
                        reply(&mut writer, wt, 554, &text).await?;
                    }
                }
            }
            "RSET" => {
                tx.reset();
                reply(&mut writer, wt, 250, "OK").await?;
            }
            "NOOP" => reply(&mut writer, wt, 250, "OK").await?,
            "QUIT" => {
                reply(&mut writer, wt, 221, "Bye").await?;
                return Ok(());
            }
            _ => reply(&mut writer, wt, 500, "Unrecognized command").await?,
        }
    }
}

// ── Wire helpers ────────────────────────────────────────────────────

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "read timed out")
}

/// Read at most `max` bytes, stopping after the first `\n`.
async fn read_bounded<R>(
    reader: &mut R,
    limit: Duration,
    max: usize,
    buf: &mut Vec<u8>,
) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut bounded = (&mut *reader).take(max as u64);
    timeout(limit, bounded.read_until(b'\n', buf))
        .await
        .map_err(|_| timed_out())?
}

/// Discard input up to and including the next `\n`.
async fn discard_line<R>(reader: &mut R, limit: Duration) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let chunk = timeout(limit, reader.fill_buf())
            .await
            .map_err(|_| timed_out())??;
        if chunk.is_empty() {
            return Ok(());
        }
        let (used, done) = match chunk.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (chunk.len(), false),
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

/// One command line without its line ending.
async fn read_line<R>(reader: &mut R, limit: Duration) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = read_bounded(reader, limit, MAX_COMMAND_LINE + 1, &mut buf).await?;
    if n == 0 {
        return Ok(Line::Closed);
    }
    if n > MAX_COMMAND_LINE {
        if !buf.ends_with(b"\n") {
            discard_line(reader, limit).await?;
        }
        return Ok(Line::TooLong);
    }
    let text = String::from_utf8_lossy(&buf);
    Ok(Line::Text(text.trim_end_matches(['\r', '\n']).to_string()))
}

/// Read a dot-terminated `DATA` payload and undo dot-stuffing.
///
/// No single read exceeds `max_message_bytes + 1`, so an endless line
/// cannot outgrow the limit. The whole payload is always consumed, even
/// past the limit, so the session stays in sync.
async fn read_data<R>(reader: &mut R, limits: &SmtpListenerConfig) -> io::Result<DataOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let chunk_limit = limits.max_message_bytes.max(2) + 1;
    let mut data = Vec::new();
    let mut chunk = Vec::new();
    let mut too_large = false;
    let mut line_start = true;

    loop {
        chunk.clear();
        let n = read_bounded(reader, limits.read_timeout, chunk_limit, &mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            ));
        }
        if line_start && (chunk == b".\r\n" || chunk == b".\n") {
            break;
        }
        let content = if line_start {
            chunk.strip_prefix(b".").unwrap_or(&chunk)
        } else {
            &chunk[..]
        };
        line_start = chunk.ends_with(b"\n");
        if too_large {
            continue;
        }
        if data.len() + content.len() > limits.max_message_bytes {
            too_large = true;
            data = Vec::new();
            continue;
        }
        data.extend_from_slice(content);
    }

    Ok(if too_large {
        DataOutcome::TooLarge
    } else {
        DataOutcome::Complete(data)
    })
}

/// Uppercased verb and the raw argument.
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim_start();
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// `FROM:<a@b> SIZE=1` → `a@b`. The null path `<>` yields an empty string.
fn parse_path(arg: &str, keyword: &str) -> Option<String> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start();
    let path = match rest.strip_prefix('<') {
        Some(inner) => inner.split_once('>')?.0,
        None => rest.split_whitespace().next()?,
    };
    Some(path.to_string())
}

async fn reply<W>(writer: &mut W, limit: Duration, code: u16, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_timed(writer, limit, format!("{code} {text}\r\n").as_bytes()).await
}

async fn multiline_reply<W>(
    writer: &mut W,
    limit: Duration,
    code: u16,
    lines: &[String],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        let sep = if i + 1 == lines.len() { ' ' } else { '-' };
        out.push_str(&format!("{code}{sep}{line}\r\n"));
    }
    write_timed(writer, limit, out.as_bytes()).await
}

async fn write_timed<W>(writer: &mut W, limit: Duration, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(limit, writer.write_all(bytes))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}
