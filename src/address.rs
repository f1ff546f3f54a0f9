//! Address helpers: domain extraction and address-list parsing.

use mail_parser::MessageParser;

/// Extract the domain part of `local@domain`.
///
/// Returns an empty string unless the address contains exactly one `@`.
pub fn domain_of(address: &str) -> &str {
    let mut parts = address.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(domain), None) => domain,
        _ => "",
    }
}

/// Parse a comma-separated address list (`a@x.com, Bob <b@y.com>`).
///
/// Fails as a whole when any entry is not a plain `local@domain` address.
pub fn parse_address_list(list: &str) -> Option<Vec<String>> {
    let list = list.trim();
    if list.is_empty() || list.contains(['\r', '\n']) {
        return None;
    }
    let raw = format!("To: {list}\r\n\r\n");
    let parsed = MessageParser::default().parse(raw.as_bytes())?;
    let addr = parsed.to()?;

    let entries: Vec<Option<&str>> = match addr {
        mail_parser::Address::List(addrs) => addrs.iter().map(|a| a.address.as_deref()).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().map(|a| a.address.as_deref()))
            .collect(),
    };

    let mut out = Vec::new();
    for entry in entries {
        let address = entry?.trim();
        if domain_of(address).is_empty() || address.starts_with('@') {
            return None;
        }
        out.push(address.to_string());
    }
    if out.is_empty() { None } else { Some(out) }
}
