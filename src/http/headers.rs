//! Request and response header fields.

use std::collections::HashMap;
use std::num::ParseIntError;

/// Header fields in arrival order. Names compare case-insensitively and a
/// name may repeat.
///
/// ```
/// use apodo::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Connection", "keep-alive, Upgrade");
/// headers.insert("Upgrade", "websocket");
///
/// assert_eq!(headers.get("upgrade"), Some("websocket"));
/// assert!(headers.has_token("connection", "upgrade"));
/// assert!(headers.wants_upgrade());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the fields httparse found in a request head. Values that are
    /// not valid UTF-8 are dropped.
    pub fn from_raw(raw: &[httparse::Header<'_>]) -> Self {
        let fields = raw
            .iter()
            .filter_map(|field| {
                let value = std::str::from_utf8(field.value).ok()?;
                Some((field.name.to_owned(), value.to_owned()))
            })
            .collect();
        Self { fields }
    }

    /// Appends a field; earlier fields of the same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Whether any comma-separated element of `name` equals `token`,
    /// ignoring case and surrounding whitespace.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|element| element.trim().eq_ignore_ascii_case(token))
    }

    /// The declared `Content-Length`, if present.
    pub fn content_length(&self) -> Option<Result<u64, ParseIntError>> {
        self.get("content-length").map(|value| value.trim().parse())
    }

    /// `true` when the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.has_token("transfer-encoding", "chunked")
    }

    /// `true` for a protocol switch request (`Connection: upgrade` plus an
    /// `Upgrade` field).
    pub fn wants_upgrade(&self) -> bool {
        self.contains("upgrade") && self.has_token("connection", "upgrade")
    }

    /// `name=value` pairs of every `Cookie` field. Malformed pairs are
    /// skipped and a repeated name keeps its last value.
    pub fn cookies(&self) -> HashMap<String, String> {
        let mut jar = HashMap::new();
        for pair in self.get_all("cookie").flat_map(|field| field.split(';')) {
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    jar.insert(name.to_owned(), value.trim().to_owned());
                }
            }
        }
        jar
    }
}
