use std::fmt::{self, Display, Formatter};

use mailparse::MailAddr;

use crate::error::MessageParseError;

/// A single `Name: value` header line.
///
/// The value's bytes are kept exactly as received (still folded, still
/// encoded) so a message written back to disk is byte-for-byte what was
/// read. [`Header::value`] is the same value as text, with any bytes that
/// are not UTF-8 replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
    raw: Vec<u8>,
}

impl Header {
    fn new(name: String, value: &str) -> Self {
        let value = fold(value);
        Self {
            name,
            raw: value.clone().into_bytes(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Trim `value` and make sure every line after the first is a continuation
/// line, so a value can never start a header of its own or end the header
/// block
fn fold(value: &str) -> String {
    let mut folded = String::with_capacity(value.len());

    for line in value.trim().lines().map(str::trim_end) {
        if line.trim_start().is_empty() {
            continue;
        }
        if !folded.is_empty() {
            folded.push('\n');
            if !line.starts_with([' ', '\t']) {
                folded.push(' ');
            }
        }
        folded.push_str(line);
    }

    folded
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |end| end + 1);
    &bytes[start..end]
}

/// A mail message: an ordered header block followed by an opaque body.
///
/// Header lookups are case-insensitive. Repeated headers keep their relative
/// order, and new headers are appended to the end of the block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl Message {
    /// Parse a message from its wire form
    ///
    /// # Errors
    /// If the header block is malformed
    pub fn parse(raw: &[u8]) -> Result<Self, MessageParseError> {
        let (parsed, offset) = mailparse::parse_headers(raw)?;

        let headers = parsed
            .iter()
            .map(|header| {
                let raw = trim_ascii(header.get_value_raw());
                Header {
                    name: header.get_key(),
                    value: String::from_utf8_lossy(raw).into_owned(),
                    raw: raw.to_vec(),
                }
            })
            .collect();

        Ok(Self {
            headers,
            body: raw.get(offset..).unwrap_or_default().to_vec(),
        })
    }

    /// Build a message from headers and a body
    ///
    /// # Errors
    /// If any header name could not be written back out
    pub fn from_parts<N, V>(
        headers: impl IntoIterator<Item = (N, V)>,
        body: impl Into<Vec<u8>>,
    ) -> Result<Self, MessageParseError>
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut message = Self {
            headers: Vec::new(),
            body: body.into(),
        };

        for (name, value) in headers {
            message.try_append(name, value)?;
        }

        Ok(message)
    }

    /// Serialise this message back into its wire form
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + self.headers.len() * 32);
        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.raw);
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    pub fn headers(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    /// The first value of the named header, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    /// Every value of the named header, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a header, keeping any existing ones with the same name.
    ///
    /// A value spanning several lines is folded so each extra line continues
    /// this header. Names are expected to be literals chosen by the caller;
    /// use [`Message::from_parts`] for names that come from outside.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        debug_assert!(valid_name(&name), "invalid header name {name:?}");
        self.headers.push(Header::new(name, &value.into()));
    }

    fn try_append(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MessageParseError> {
        let name = name.into();
        if !valid_name(&name) {
            return Err(MessageParseError::InvalidHeaderName(name));
        }

        self.append(name, value);
        Ok(())
    }

    /// Replace every occurrence of a header with a single new value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.append(name, value);
    }

    /// Remove every occurrence of a header, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// The address this message claims to be from.
    ///
    /// `Sender:` wins over `From:`; the address is lower-cased so it can be
    /// compared against list membership directly.
    pub fn sender(&self) -> Option<String> {
        ["sender", "from"]
            .into_iter()
            .filter_map(|name| self.get(name))
            .find_map(first_address)
    }

    /// Every address named in the `To:` headers, lower-cased
    pub fn to_addresses(&self) -> Vec<String> {
        self.get_all("to")
            .filter_map(|value| mailparse::addrparse(value).ok())
            .flat_map(|list| {
                list.iter()
                    .flat_map(|addr| match addr {
                        MailAddr::Single(single) => vec![single.addr.to_ascii_lowercase()],
                        MailAddr::Group(group) => group
                            .addrs
                            .iter()
                            .map(|single| single.addr.to_ascii_lowercase())
                            .collect(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Parse this message as MIME, for callers that need to walk its parts
    ///
    /// # Errors
    /// If the serialised message is not valid MIME
    pub fn with_mime<T>(
        &self,
        f: impl FnOnce(&mailparse::ParsedMail<'_>) -> T,
    ) -> Result<T, MessageParseError> {
        let raw = self.to_bytes();
        let parsed = mailparse::parse_mail(&raw)?;
        Ok(f(&parsed))
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}

fn first_address(value: &str) -> Option<String> {
    let list = mailparse::addrparse(value).ok()?;
    list.iter().find_map(|addr| match addr {
        MailAddr::Single(single) => Some(single.addr.to_ascii_lowercase()),
        MailAddr::Group(group) => group
            .addrs
            .first()
            .map(|single| single.addr.to_ascii_lowercase()),
    })
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}
