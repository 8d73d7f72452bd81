//! Header fields of a request or response.
//!
//! Field names are stored exactly as received; every lookup compares them
//! without regard to ASCII case ([RFC 9110 §5.1]).
//!
//! [RFC 9110 §5.1]: https://www.rfc-editor.org/rfc/rfc9110#section-5.1

use std::fmt;

use thiserror::Error;

/// A request repeated a field name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("duplicate header field `{0}`")]
pub struct DuplicateHeader(pub String);

#[derive(Debug, Clone)]
struct Field {
    name: String,
    value: String,
}

impl Field {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Header fields in arrival order.
///
/// The request parser adds fields with [`insert_unique`](Self::insert_unique)
/// so a repeated name fails the request. Responses use
/// [`insert`](Self::insert), where repeats such as `Set-Cookie` are legal.
///
/// # Examples
///
/// ```
/// use webserv::http::Headers;
///
/// let mut fields = Headers::new();
/// fields.insert_unique("Host", "localhost").unwrap();
/// assert!(fields.insert_unique("host", "example.com").is_err());
/// assert_eq!(fields.get("HOST"), Some("localhost"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<Field>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Adds a field, keeping any earlier one with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Adds a field unless its name is already present.
    pub fn insert_unique(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), DuplicateHeader> {
        let name = name.into();
        if self.contains(&name) {
            return Err(DuplicateHeader(name));
        }
        self.insert(name, value);
        Ok(())
    }

    /// Value of the first field called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.is(name))
            .map(|field| field.value.as_str())
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

    /// `(name, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|field| (field.name.as_str(), field.value.as_str()))
    }
}

/// Wire form: one `name: value` line per field, each ending in CRLF.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fields
            .iter()
            .try_for_each(|field| write!(f, "{}: {}\r\n", field.name, field.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut fields = Headers::new();
        fields.insert("Content-Type", "text/html");
        for name in ["content-type", "CONTENT-TYPE", "Content-type"] {
            assert_eq!(fields.get(name), Some("text/html"), "{name}");
        }
        assert!(!fields.contains("Content-Length"));
    }

    #[test]
    fn response_fields_may_repeat() {
        let mut fields = Headers::new();
        fields.insert("Set-Cookie", "a=1");
        fields.insert("set-cookie", "b=2");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("Set-Cookie"), Some("a=1"));
        assert_eq!(fields.to_string(), "Set-Cookie: a=1\r\nset-cookie: b=2\r\n");
    }

    #[test]
    fn request_fields_must_not_repeat() {
        let mut fields = Headers::new();
        fields.insert_unique("Accept", "*/*").unwrap();
        fields.insert_unique("Host", "a").unwrap();
        assert_eq!(
            fields.insert_unique("ACCEPT", "text/html"),
            Err(DuplicateHeader("ACCEPT".into()))
        );
        assert_eq!(fields.get("accept"), Some("*/*"));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn received_case_is_preserved() {
        let mut fields = Headers::new();
        fields.insert_unique("x-Custom-ID", "7").unwrap();
        assert_eq!(fields.iter().collect::<Vec<_>>(), [("x-Custom-ID", "7")]);
    }
}
