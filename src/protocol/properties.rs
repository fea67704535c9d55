//! Message properties and their wire encoding.
//!
//! Properties are an ordered list of name/value string pairs. On the wire
//! the section is `varint(byte length)` followed by alternating
//! NUL-terminated names and values. Strings from the well-known table are
//! shortened to a single token byte below 32; the table is part of the
//! protocol and must be identical on both peers.

use crate::error::BlipError;
use crate::protocol::frame::{get_uvarint, put_uvarint};

/// Strings replaced by one-byte tokens during encoding. The token value is
/// the index plus one, so order matters: both peers must compile the
/// identical table or property sections will not decode.
pub(crate) const WELL_KNOWN_STRINGS: &[&str] = &[
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

/// An ordered sequence of name/value property pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Properties {
        Properties::default()
    }

    /// Append a property. Names are not deduplicated; lookups return the
    /// first match.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode the property section, including its length prefix.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> Result<(), BlipError> {
        let mut section = Vec::new();
        for (name, value) in &self.entries {
            encode_string(&mut section, name)?;
            encode_string(&mut section, value)?;
        }
        put_uvarint(out, section.len() as u64);
        out.extend_from_slice(&section);
        Ok(())
    }

    /// Decode a property section from the front of `data`, returning the
    /// properties and the number of bytes consumed.
    pub(crate) fn decode(data: &[u8]) -> Result<(Properties, usize), BlipError> {
        let (length, header) = get_uvarint(data)?;
        let available = (data.len() - header) as u64;
        if length > available {
            return Err(BlipError::Protocol("truncated property section".into()));
        }
        let total = header + length as usize;
        let mut section = &data[header..total];
        let mut entries = Vec::new();
        while !section.is_empty() {
            let name = read_string(&mut section)?;
            if section.is_empty() {
                return Err(BlipError::Protocol(
                    "property name without a value".into(),
                ));
            }
            let value = read_string(&mut section)?;
            entries.push((name, value));
        }
        Ok((Properties { entries }, total))
    }
}

fn encode_string(out: &mut Vec<u8>, s: &str) -> Result<(), BlipError> {
    if let Some(index) = WELL_KNOWN_STRINGS.iter().position(|w| *w == s) {
        out.push(index as u8 + 1);
        out.push(0);
        return Ok(());
    }
    if s.bytes().any(|b| b < 32) {
        return Err(BlipError::InvalidProperty(s.escape_default().to_string()));
    }
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

fn read_string(section: &mut &[u8]) -> Result<String, BlipError> {
    let nul = section
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| BlipError::Protocol("unterminated property string".into()))?;
    let raw = &section[..nul];
    *section = &section[nul + 1..];
    if raw.len() == 1 && raw[0] < 32 {
        let index = raw[0] as usize - 1;
        return WELL_KNOWN_STRINGS
            .get(index)
            .map(|s| (*s).to_string())
            .ok_or_else(|| BlipError::Protocol(format!("unknown property token {}", raw[0])));
    }
    if raw.iter().any(|&b| b < 32) {
        return Err(BlipError::Protocol(
            "stray control byte in property string".into(),
        ));
    }
    String::from_utf8(raw.to_vec())
        .map_err(|_| BlipError::Protocol("property string is not valid UTF-8".into()))
}
