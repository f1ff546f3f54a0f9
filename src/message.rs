//! Structured RFC-822 headers over `mail-parser`.
//!
//! `parse_message` only answers "is this a structured message, and if so
//! what are its headers and body". Anything that does not start with a
//! valid header block is treated as a raw body by the envelope builder.
//! Header values are kept as the raw bytes of the field, so 8-bit and
//! folded values are relayed unchanged.

use mail_parser::MessageParser;

/// Well-known header fields, plus `Other` for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderName {
    From,
    To,
    Cc,
    Bcc,
    Subject,
    Other(String),
}

impl HeaderName {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "from" => Self::From,
            "to" => Self::To,
            "cc" => Self::Cc,
            "bcc" => Self::Bcc,
            "subject" => Self::Subject,
            _ => Self::Other(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::From => "From",
            Self::To => "To",
            Self::Cc => "Cc",
            Self::Bcc => "Bcc",
            Self::Subject => "Subject",
            Self::Other(name) => name,
        }
    }

    fn matches(&self, other: &HeaderName) -> bool {
        match (self, other) {
            (Self::Other(a), Self::Other(b)) => a.eq_ignore_ascii_case(b),
            (a, b) => a == b,
        }
    }
}

/// Ordered header fields, one entry per occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(HeaderName, Vec<u8>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append one occurrence at the end.
    pub fn append(&mut self, name: HeaderName, value: impl Into<Vec<u8>>) {
        self.fields.push((name, value.into()));
    }

    /// Collapse a field to a single value at the position of its first
    /// occurrence, or append it.
    pub fn set(&mut self, name: HeaderName, value: impl Into<Vec<u8>>) {
        let value = value.into();
        let mut seen = false;
        self.fields
            .retain(|(n, _)| !n.matches(&name) || !std::mem::replace(&mut seen, true));
        match self.fields.iter_mut().find(|(n, _)| n.matches(&name)) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    /// First value of a field, if it is valid UTF-8.
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.matches(name))
            .find_map(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// Every UTF-8 value of a field, in order.
    pub fn get_all<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.matches(name))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        self.fields.iter().any(|(n, _)| n.matches(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &[u8])> {
        self.fields.iter().map(|(n, v)| (n, v.as_slice()))
    }
}

/// A message whose leading header block parsed cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub headers: Headers,
    /// Decoded `Subject`, RFC 2047 words resolved.
    pub subject: Option<String>,
    pub body: Vec<u8>,
}

/// Parse `raw` as an RFC-822 message.
///
/// The first line must be a `Name: value` field and every field name must
/// be a valid RFC 5322 name. The body starts after the first empty line
/// (or is empty for a header-only message). Returns `None` otherwise.
pub fn parse_message(raw: &[u8]) -> Option<ParsedMessage> {
    let message = MessageParser::default().parse(raw)?;
    let root = message.parts.first()?;
    if root.headers.first()?.offset_field != 0 {
        return None;
    }

    let mut headers = Headers::new();
    for header in &root.headers {
        let field = raw.get(header.offset_field as usize..header.offset_start as usize)?;
        let name = field.strip_suffix(b":")?;
        if !is_field_name(name) {
            return None;
        }
        let value = raw.get(header.offset_start as usize..header.offset_end as usize)?;
        headers.append(
            HeaderName::parse(std::str::from_utf8(name).ok()?),
            value.trim_ascii(),
        );
    }

    Some(ParsedMessage {
        headers,
        subject: message.subject().map(str::to_string),
        body: raw.get(root.offset_body as usize..).unwrap_or_default().to_vec(),
    })
}

/// RFC 5322 field name: printable ASCII except colon and space.
fn is_field_name(name: &[u8]) -> bool {
    !name.is_empty() && name.iter().all(|b| (33..=126).contains(b) && *b != b':')
}
