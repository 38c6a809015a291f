//! Ordered FlowFile attributes and their wire encoding.
//!
//! # Wire format
//!
//! ```text
//! [7 bytes: "NiFiFF3"]
//! [2 bytes BE: attribute count]
//! PER ATTRIBUTE:
//!   [2 bytes BE: name_len]  [name_len bytes: name]
//!   [2 bytes BE: value_len] [value_len bytes: value]
//! ```
//!
//! A stream may also end with the 7-byte `"NiFiEOF"` sentinel, which decodes
//! the same way as a clean end of input.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FlowFileError;

/// Header magic that starts every FlowFile v3 record.
pub const MAGIC_V3: &[u8; 7] = b"NiFiFF3";

/// Sentinel marking the end of a FlowFile stream.
pub const MAGIC_EOF: &[u8; 7] = b"NiFiEOF";

pub const UUID: &str = "uuid";
pub const FILENAME: &str = "filename";
pub const PATH: &str = "path";
pub const CHECKSUM: &str = "checksum";
pub const CHECKSUM_TYPE: &str = "checksumType";
pub const FRAGMENT_IDENTIFIER: &str = "fragment.identifier";
pub const FRAGMENT_OFFSET: &str = "fragment.offset";
pub const FRAGMENT_INDEX: &str = "fragment.index";
pub const FRAGMENT_COUNT: &str = "fragment.count";
pub const SEGMENT_ORIGINAL_SIZE: &str = "segment.original.size";
pub const SEGMENT_ORIGINAL_FILENAME: &str = "segment.original.filename";
pub const SEGMENT_ORIGINAL_CHECKSUM: &str = "segment.original.checksum";
pub const SEGMENT_ORIGINAL_CHECKSUM_TYPE: &str = "segment.original.checksumType";
pub const KIND: &str = "kind";
pub const TARGET: &str = "target";
pub const LAST_MODIFIED_TIME: &str = "file.lastModifiedTime";
pub const CREATION_TIME: &str = "file.creationTime";
pub const PERMISSIONS: &str = "file.permissions";

/// A single name/value pair in a FlowFile header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// Ordered attribute set. Insertion order is wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attribute> {
        self.0.iter()
    }

    /// Returns the value of the first attribute named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Returns `true` if an attribute named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|a| a.name == name)
    }

    /// Replaces the first attribute named `name`, or appends a new one.
    ///
    /// Values stored under `filename` lose any directory components.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let mut value = value.into();
        if name == FILENAME {
            value = base_name(&value).to_string();
        }
        match self.0.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.0.push(Attribute { name, value }),
        }
        self
    }

    /// Removes every attribute named `name`. Returns `true` if any were removed.
    pub fn unset(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|a| a.name != name);
        self.0.len() != before
    }

    /// Sets a fresh random `uuid` and returns it.
    pub fn generate_uuid(&mut self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.set(UUID, id.clone());
        id
    }

    /// Sorts by name using natural ordering (numbers compare by value,
    /// text case-insensitively).
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| natural_cmp(&a.name, &b.name));
    }

    /// Appends without checking for an existing name.
    pub(crate) fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Attribute {
            name: name.into(),
            value: value.into(),
        });
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&Attribute) -> bool) {
        self.0.retain(f);
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Attribute> {
        self.0.iter_mut()
    }

    /// JSON rendering for diagnostics, in wire order.
    pub fn to_json(&self) -> Result<String, FlowFileError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, FlowFileError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Appends the binary header (magic, count, pairs) to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), FlowFileError> {
        let count = u16::try_from(self.0.len()).map_err(|_| {
            FlowFileError::Malformed(format!(
                "too many attributes: {} (max {})",
                self.0.len(),
                u16::MAX
            ))
        })?;
        out.extend_from_slice(MAGIC_V3);
        out.extend_from_slice(&count.to_be_bytes());
        for attr in &self.0 {
            put_field(out, "name", &attr.name)?;
            put_field(out, "value", &attr.value)?;
        }
        Ok(())
    }

    /// Writes the binary header to `writer`. Returns the number of bytes written.
    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<u64, FlowFileError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        writer.write_all(&buf).await?;
        Ok(buf.len() as u64)
    }

    /// Reads a binary header from `reader`.
    ///
    /// Returns `None` on a clean end of stream (no bytes at all, or the
    /// `NiFiEOF` sentinel). Names and values that are not valid UTF-8 are
    /// rejected as malformed.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Option<Self>, FlowFileError> {
        let mut magic = [0u8; 7];
        let mut filled = 0;
        while filled < magic.len() {
            let n = reader.read(&mut magic[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => return Ok(None),
            7 => {}
            n => {
                return Err(FlowFileError::Malformed(format!(
                    "truncated header magic: {n} of 7 bytes"
                )));
            }
        }
        if &magic == MAGIC_EOF {
            return Ok(None);
        }
        if &magic != MAGIC_V3 {
            return Err(FlowFileError::NoHeader);
        }

        let count = reader
            .read_u16()
            .await
            .map_err(|e| truncated("attribute count", e))?;
        let mut attrs = Attributes(Vec::with_capacity(count as usize));
        for _ in 0..count {
            let name = read_field(reader, "attribute name").await?;
            let value = read_field(reader, "attribute value").await?;
            attrs.set(name, value);
        }
        Ok(Some(attrs))
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = &'a Attribute;
    type IntoIter = std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.set(k, v);
        }
        attrs
    }
}

fn base_name(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

fn put_field(out: &mut Vec<u8>, what: &str, s: &str) -> Result<(), FlowFileError> {
    let len = u16::try_from(s.len()).map_err(|_| {
        FlowFileError::Malformed(format!(
            "attribute {what} too long: {} bytes (max {})",
            s.len(),
            u16::MAX
        ))
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

async fn read_field<R: AsyncRead + Unpin>(
    reader: &mut R,
    what: &str,
) -> Result<String, FlowFileError> {
    let len = reader.read_u16().await.map_err(|e| truncated(what, e))?;
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| truncated(what, e))?;
    String::from_utf8(buf).map_err(|_| FlowFileError::Malformed(format!("{what} is not UTF-8")))
}

fn truncated(what: &str, err: std::io::Error) -> FlowFileError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FlowFileError::Malformed(format!("truncated {what}"))
    } else {
        FlowFileError::Io(err)
    }
}

/// Compares strings treating runs of ASCII digits as numbers.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (ca, cb) = (chunks(a), chunks(b));
    for (x, y) in ca.iter().zip(cb.iter()) {
        let ord = match (is_number(x), is_number(y)) {
            (true, true) => {
                let (xt, yt) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                xt.len().cmp(&yt.len()).then_with(|| xt.cmp(yt))
            }
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => x.to_lowercase().cmp(&y.to_lowercase()),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ca.len().cmp(&cb.len()).then_with(|| a.cmp(b))
}

fn chunks(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev: Option<bool> = None;
    for (i, c) in s.char_indices() {
        let digit = c.is_ascii_digit();
        if prev.is_some_and(|p| p != digit) {
            out.push(&s[start..i]);
            start = i;
        }
        prev = Some(digit);
    }
    if start < s.len() {
        out.push(&s[start..]);
    }
    out
}

fn is_number(chunk: &str) -> bool {
    chunk.as_bytes().first().is_some_and(u8::is_ascii_digit)
}
