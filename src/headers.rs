//! Minimal HTTP request/header types.
//!
//! The real HTTP/1.1 parser and its request/response types live outside this
//! crate; these wrappers around [`http::HeaderMap`] exist only so the
//! upgrader has something concrete to validate and mutate, including a
//! "canonical form" accessor for comma-separated list headers.

use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};

/// The request-line and headers of an HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct HttpRequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HttpHeaders,
}

impl HttpRequestHead {
    pub fn new(method: Method, uri: Uri, version: Version, headers: HttpHeaders) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
        }
    }
}

/// A multimap from case-insensitive header name to ordered list of values.
#[derive(Debug, Clone, Default)]
pub struct HttpHeaders(HeaderMap<HeaderValue>);

impl HttpHeaders {
    pub fn new() -> Self {
        Self(HeaderMap::new())
    }

    /// Append `value` under `name`, keeping any existing values.
    pub fn add(&mut self, name: HeaderName, value: HeaderValue) {
        self.0.append(name, value);
    }

    /// Remove every existing value for `name` and insert `value` as the sole one.
    pub fn replace_or_add(&mut self, name: HeaderName, value: HeaderValue) {
        self.0.insert(name, value);
    }

    /// The canonical form of `name`: every stored value, with comma-separated
    /// list values split into individual elements and surrounding ASCII
    /// whitespace trimmed. Order is preserved.
    pub fn canonical_form(&self, name: &HeaderName) -> Vec<String> {
        self.0
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()
    }

    /// Read `name` via [`Self::canonical_form`], requiring exactly one value.
    ///
    /// Returns `None` if the header is absent or supplied more than once
    /// (including as a comma-separated list) — the upgrader turns that into
    /// [`crate::error::UpgradeError::InvalidUpgradeHeader`].
    pub fn single(&self, name: &HeaderName) -> Option<String> {
        let mut values = self.canonical_form(name);
        if values.len() == 1 {
            values.pop()
        } else {
            None
        }
    }

    /// Read `name`'s single stored value verbatim: no comma-splitting, no
    /// whitespace trimming. Returns `None` if the header is absent, supplied
    /// more than once, or not valid UTF-8.
    ///
    /// Use this instead of [`Self::single`] where the caller needs exact
    /// string equality against a fixed token (e.g. `Sec-WebSocket-Version`
    /// against `"13"`) rather than list semantics.
    pub fn single_exact(&self, name: &HeaderName) -> Option<String> {
        let mut values = self.0.get_all(name).iter();
        let only = values.next()?;
        if values.next().is_some() {
            return None;
        }
        only.to_str().ok().map(str::to_string)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> HeaderMap<HeaderValue> {
        self.0
    }
}

impl From<HeaderMap<HeaderValue>> for HttpHeaders {
    fn from(map: HeaderMap<HeaderValue>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONNECTION;

    #[test]
    fn canonical_form_splits_comma_separated_values() {
        let mut headers = HttpHeaders::new();
        headers.add(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(headers.canonical_form(&CONNECTION), vec!["keep-alive", "Upgrade"]);
    }

    #[test]
    fn single_rejects_duplicates() {
        let mut headers = HttpHeaders::new();
        headers.add(CONNECTION, HeaderValue::from_static("a"));
        headers.add(CONNECTION, HeaderValue::from_static("b"));
        assert_eq!(headers.single(&CONNECTION), None);
    }

    #[test]
    fn single_rejects_comma_separated_duplicates() {
        let mut headers = HttpHeaders::new();
        headers.add(CONNECTION, HeaderValue::from_static("a,b"));
        assert_eq!(headers.single(&CONNECTION), None);
    }

    #[test]
    fn single_accepts_lone_value() {
        let mut headers = HttpHeaders::new();
        headers.add(CONNECTION, HeaderValue::from_static("upgrade"));
        assert_eq!(headers.single(&CONNECTION).as_deref(), Some("upgrade"));
    }

    #[test]
    fn single_exact_preserves_trailing_whitespace() {
        let mut headers = HttpHeaders::new();
        headers.add(CONNECTION, HeaderValue::from_static("13 "));
        assert_eq!(headers.single_exact(&CONNECTION).as_deref(), Some("13 "));
    }

    #[test]
    fn single_exact_does_not_split_on_comma() {
        let mut headers = HttpHeaders::new();
        headers.add(CONNECTION, HeaderValue::from_static("13,13"));
        assert_eq!(headers.single_exact(&CONNECTION).as_deref(), Some("13,13"));
    }

    #[test]
    fn single_exact_rejects_duplicates() {
        let mut headers = HttpHeaders::new();
        headers.add(CONNECTION, HeaderValue::from_static("a"));
        headers.add(CONNECTION, HeaderValue::from_static("b"));
        assert_eq!(headers.single_exact(&CONNECTION), None);
    }
}
