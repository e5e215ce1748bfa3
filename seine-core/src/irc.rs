//! IRC line codec: parsing of inbound server lines and the handful of
//! helpers the send path shares.
//!
//! Outbound commands are formatted inline at the call sites (they are
//! one `format!` each); inbound lines go through [`Message::parse`].

/// One parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Prefix without the leading `:` (e.g. `nick!user@host`), if any.
    pub prefix: Option<String>,
    /// Command or three-digit numeric, as received.
    pub command: String,
    /// Parameters; a trailing parameter loses its leading `:`.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a single line (with or without trailing CR/LF).
    ///
    /// Returns `None` for empty or structurally hopeless lines; the
    /// caller logs and keeps the connection alive.
    pub fn parse(line: &str) -> Option<Message> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        let (prefix, rest) = if let Some(stripped) = line.strip_prefix(':') {
            let (p, r) = stripped.split_once(' ')?;
            (Some(p.to_string()), r)
        } else {
            (None, line)
        };

        let (head, trailing) = match rest.split_once(" :") {
            Some((h, t)) => (h, Some(t)),
            None => (rest, None),
        };

        let mut parts = head.split_ascii_whitespace();
        let command = parts.next()?.to_string();
        let mut params: Vec<String> = parts.map(str::to_string).collect();
        if let Some(t) = trailing {
            params.push(t.to_string());
        }

        Some(Message { prefix, command, params })
    }

    /// Nick portion of the prefix (`nick!user@host` → `nick`).
    pub fn sender_nick(&self) -> Option<&str> {
        let p = self.prefix.as_deref()?;
        Some(p.split(['!', '@']).next().unwrap_or(p))
    }

    /// Is the command a three-digit numeric reply?
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Lowercase a channel name and ensure the leading `#`.
pub fn normalize_channel(name: &str) -> String {
    let name = name.trim();
    let lower = name.to_ascii_lowercase();
    if lower.starts_with('#') {
        lower
    } else {
        format!("#{lower}")
    }
}

/// CTCP delimiter.
pub const CTCP_MARKER: char = '\u{1}';

/// If `text` is a CTCP request, return `(keyword, body)`.
pub fn parse_ctcp(text: &str) -> Option<(&str, &str)> {
    let inner = text.strip_prefix(CTCP_MARKER)?;
    let inner = inner.strip_suffix(CTCP_MARKER).unwrap_or(inner);
    match inner.split_once(' ') {
        Some((kw, body)) => Some((kw, body)),
        None => Some((inner, "")),
    }
}
