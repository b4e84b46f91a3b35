//! Client network identity.
//!
//! The identity is the originating client address as reported by the edge
//! network in a request header (by default `cf-connecting-ip`). It is only
//! ever used as a lookup key into the session store.

use http::HeaderMap;
use http::header::HeaderName;
use std::fmt;

/// Originating client address, as reported by the edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read the identity from `header`. Missing, non-UTF-8 or blank values
    /// yield `None`.
    pub fn from_headers(headers: &HeaderMap, header: &HeaderName) -> Option<Self> {
        headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_reads_configured_header() {
        let header = HeaderName::from_static("cf-connecting-ip");
        let mut headers = HeaderMap::new();
        headers.insert(header.clone(), HeaderValue::from_static(" 203.0.113.7 "));

        let identity = ClientIdentity::from_headers(&headers, &header).unwrap();
        assert_eq!(identity.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_missing_or_blank_header() {
        let header = HeaderName::from_static("cf-connecting-ip");
        assert!(ClientIdentity::from_headers(&HeaderMap::new(), &header).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header.clone(), HeaderValue::from_static("  "));
        assert!(ClientIdentity::from_headers(&headers, &header).is_none());
    }

    #[test]
    fn test_other_headers_ignored() {
        let header = HeaderName::from_static("cf-connecting-ip");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        assert!(ClientIdentity::from_headers(&headers, &header).is_none());
    }
}
