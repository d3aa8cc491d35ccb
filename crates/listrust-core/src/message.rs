//! Message model
//!
//! A [`Message`] is the raw RFC 822 bytes plus the unfolded header list,
//! kept in order and looked up case-insensitively. MIME structure is
//! parsed on demand with `mail-parser`. Rules only ever see `&Message`.

use listrust_common::{Error, Result};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    raw: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl Message {
    /// Parse a message from its raw bytes
    pub fn from_bytes(raw: impl Into<Vec<u8>>) -> Result<Self> {
        let raw = raw.into();
        let headers = parse_headers(&raw);

        if headers.is_empty() {
            return Err(Error::Parse("Message has no header section".to_string()));
        }

        Ok(Self { raw, headers })
    }

    /// A message with no headers and no body, used for trigger records
    pub fn empty() -> Self {
        Self {
            raw: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// All headers in message order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of a header, in message order
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Decoded Subject header
    pub fn subject(&self) -> Option<String> {
        let decoded = MessageParser::default()
            .parse(&self.raw)
            .and_then(|parsed| parsed.subject().map(|s| s.to_string()));
        decoded.or_else(|| self.header("Subject").map(|s| s.to_string()))
    }

    /// Address of the author: From, falling back to Sender
    pub fn sender(&self) -> Option<String> {
        let parsed = MessageParser::default().parse(&self.raw)?;
        parsed
            .from()
            .or_else(|| parsed.sender())
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_lowercase())
    }

    /// Message-ID without angle brackets
    pub fn message_id(&self) -> Option<String> {
        self.header("Message-ID")
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string())
            .filter(|id| !id.is_empty())
    }

    /// The first text/plain part of the body, if there is one
    pub fn first_text_plain(&self) -> Option<String> {
        let parsed = MessageParser::default().parse(&self.raw)?;

        parsed.parts.iter().find_map(|part| {
            let PartType::Text(text) = &part.body else {
                return None;
            };
            let is_plain = match MimeHeaders::content_type(part) {
                None => true,
                Some(ct) => {
                    ct.ctype().eq_ignore_ascii_case("text")
                        && ct
                            .subtype()
                            .map(|s| s.eq_ignore_ascii_case("plain"))
                            .unwrap_or(true)
                }
            };
            is_plain.then(|| text.to_string())
        })
    }

    /// Key used to recognize a redelivered copy of this message
    pub fn dedupe_key(&self) -> String {
        match self.message_id() {
            Some(id) => format!("mid:{}", id),
            None => format!("sha256:{}", hex::encode(Sha256::digest(&self.raw))),
        }
    }
}

/// Header fields in message order with their values unfolded
fn parse_headers(raw: &[u8]) -> Vec<(String, String)> {
    let Some(parsed) = MessageParser::default().parse_headers(raw) else {
        return Vec::new();
    };

    parsed
        .headers()
        .iter()
        .map(|header| {
            let value = raw
                .get(header.offset_start..header.offset_end)
                .map(unfold)
                .unwrap_or_default();
            (header.name.as_str().to_string(), value)
        })
        .collect()
}

fn unfold(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
