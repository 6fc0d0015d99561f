//! The BulkRequest message and the raw HTTP request it carries.
//!
//! The BulkRequest is a protobuf message (`scheme = 1`, `request = 2`).
//! The request field holds the client's HTTP request verbatim; it is only
//! parsed when the translator needs its start line, headers or body.

use std::borrow::Cow;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use prost::Message;

use crate::error::ProtocolError;

/// URL scheme the original request was made with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Scheme {
    Http = 0,
    Https = 1,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// One request to render: a scheme plus the raw HTTP request bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BulkRequest {
    #[prost(enumeration = "Scheme", tag = "1")]
    pub scheme: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub request: Vec<u8>,
}

impl BulkRequest {
    pub fn from_parts(scheme: Scheme, request: impl Into<Vec<u8>>) -> Self {
        Self {
            scheme: scheme as i32,
            request: request.into(),
        }
    }

    /// Decode a frame payload, rejecting scheme values outside the enum.
    pub fn from_frame(payload: &[u8]) -> Result<Self, ProtocolError> {
        let request = BulkRequest::decode(payload)?;
        request.checked_scheme()?;
        Ok(request)
    }

    pub fn checked_scheme(&self) -> Result<Scheme, ProtocolError> {
        Scheme::try_from(self.scheme).map_err(|_| ProtocolError::UnknownScheme(self.scheme))
    }

    /// Parse the embedded HTTP request.
    pub fn http_request(&self) -> Result<HttpRequest, ProtocolError> {
        HttpRequest::parse(&self.request)
    }
}

/// A parsed view of a raw HTTP request.
///
/// Header lookups are case-insensitive. When a header is repeated the first
/// occurrence wins.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    first_line: String,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpRequest {
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let (head, body) = split_head(raw);
        let head = String::from_utf8_lossy(head);
        let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

        let first_line = match lines.next() {
            Some(line) if !line.trim().is_empty() => line.to_string(),
            _ => return Err(ProtocolError::MalformedRequest("empty start line".into())),
        };

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProtocolError::MalformedRequest(format!("header line without colon: {:?}", line))
            })?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| ProtocolError::MalformedRequest(format!("header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| ProtocolError::MalformedRequest(format!("header {}: {}", name, e)))?;
            headers.append(name, value);
        }

        Ok(Self {
            first_line,
            headers,
            body: Bytes::copy_from_slice(body),
        })
    }

    pub fn first_line(&self) -> &str {
        &self.first_line
    }

    /// The method token of the start line.
    pub fn method(&self) -> &str {
        self.first_line.split(' ').next().unwrap_or("")
    }

    /// Everything from the first `/` of the start line up to the next space.
    pub fn path(&self) -> &str {
        let line = self.first_line.as_str();
        let Some(start) = line.find('/') else {
            return "";
        };
        let end = line[start..].find(' ').map_or(line.len(), |i| start + i);
        &line[start..end]
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// First value of `name`, if present.
    pub fn header(&self, name: &str) -> Option<Cow<'_, str>> {
        self.headers
            .get(name)
            .map(|value| String::from_utf8_lossy(value.as_bytes()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

fn split_head(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return (&raw[..pos], &raw[pos + 4..]);
    }
    if let Some(pos) = find(raw, b"\n\n") {
        return (&raw[..pos], &raw[pos + 2..]);
    }
    (raw, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
