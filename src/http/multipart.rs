//! `multipart/form-data` body splitting ([RFC 7578]).
//!
//! [`Parts`] walks a fully received body lazily, one part per iteration, so a
//! caller that writes files as it goes stops at the first malformed part.
//!
//! [RFC 7578]: https://www.rfc-editor.org/rfc/rfc7578

use std::path::Path;

use thiserror::Error;

/// Maximum number of header lines inside one part.
const MAX_PART_HEADERS: usize = 16;

/// Structural errors in a multipart body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("body does not start with the boundary delimiter")]
    MissingOpeningBoundary,

    #[error("part is not followed by a boundary delimiter")]
    Unterminated,

    #[error("unexpected bytes after a boundary delimiter")]
    MalformedBoundary,

    #[error("malformed part header block")]
    MalformedHeaders,

    #[error("part has no `form-data; name=\"...\"` Content-Disposition")]
    MissingDisposition,

    #[error("unsafe upload file name `{0}`")]
    InvalidFilename(String),

    #[error("data after the closing boundary")]
    TrailingData,
}

/// One part of a multipart body, borrowing from the body buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part<'a> {
    /// The form field name.
    pub name: &'a str,
    /// The client-side file name, present for file parts only.
    pub filename: Option<&'a str>,
    /// Raw part content, without the delimiting CRLF.
    pub content: &'a [u8],
}

/// Extracts the `boundary=` parameter from a `Content-Type` value.
///
/// ```
/// use webserv::http::multipart::boundary;
///
/// assert_eq!(boundary("multipart/form-data; boundary=XyZ"), Some("XyZ"));
/// assert_eq!(boundary("multipart/form-data; boundary=\"a b\""), Some("a b"));
/// assert_eq!(boundary("text/plain"), None);
/// ```
pub fn boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|value| value.trim_matches('"'))
        .filter(|value| !value.is_empty())
}

/// Iterator over the parts of a multipart body.
pub struct Parts<'a> {
    body: &'a [u8],
    delimiter: Vec<u8>,
    pos: usize,
    started: bool,
    done: bool,
}

impl<'a> Parts<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            body,
            delimiter,
            pos: 0,
            started: false,
            done: false,
        }
    }

    fn fail(&mut self, error: MultipartError) -> Option<Result<Part<'a>, MultipartError>> {
        self.done = true;
        Some(Err(error))
    }

    // Inspects the bytes right after a delimiter. `Ok(true)` means the closing
    // `--` marker was found.
    fn after_delimiter(&mut self) -> Result<bool, MultipartError> {
        let rest = &self.body[self.pos..];
        if let Some(tail) = rest.strip_prefix(b"--") {
            return match tail {
                b"" | b"\r\n" => Ok(true),
                _ => Err(MultipartError::TrailingData),
            };
        }
        if rest.starts_with(b"\r\n") {
            self.pos += 2;
            return Ok(false);
        }
        Err(MultipartError::MalformedBoundary)
    }
}

impl<'a> Iterator for Parts<'a> {
    type Item = Result<Part<'a>, MultipartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if !self.started {
            self.started = true;
            if !self.body.starts_with(&self.delimiter) {
                return self.fail(MultipartError::MissingOpeningBoundary);
            }
            self.pos = self.delimiter.len();
        }

        match self.after_delimiter() {
            Ok(true) => {
                self.done = true;
                return None;
            }
            Ok(false) => {}
            Err(e) => return self.fail(e),
        }

        let body = self.body;
        let start = self.pos;
        let Some(end) = find_terminator(&body[start..], &self.delimiter).map(|i| start + i) else {
            return self.fail(MultipartError::Unterminated);
        };
        self.pos = end + 2 + self.delimiter.len();

        match parse_part(&body[start..end]) {
            Ok(part) => Some(Ok(part)),
            Err(e) => self.fail(e),
        }
    }
}

// Position of the next `\r\n--boundary` in `haystack`.
fn find_terminator(haystack: &[u8], delimiter: &[u8]) -> Option<usize> {
    let needle_len = delimiter.len() + 2;
    haystack
        .windows(needle_len)
        .position(|w| w.starts_with(b"\r\n") && &w[2..] == delimiter)
}

fn parse_part(raw: &[u8]) -> Result<Part<'_>, MultipartError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
    let (offset, headers) = match httparse::parse_headers(raw, &mut headers) {
        Ok(httparse::Status::Complete(parsed)) => parsed,
        _ => return Err(MultipartError::MalformedHeaders),
    };

    let disposition = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Content-Disposition"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .ok_or(MultipartError::MissingDisposition)?;

    let (name, filename) =
        parse_disposition(disposition).ok_or(MultipartError::MissingDisposition)?;

    // Browsers send `filename=""` for an empty file input; treat it as a field.
    let filename = filename.filter(|f| !f.is_empty());
    if let Some(filename) = filename {
        let is_plain_name = Path::new(filename)
            .file_name()
            .is_some_and(|base| base == filename);
        if !is_plain_name || filename.contains('\\') {
            return Err(MultipartError::InvalidFilename(filename.to_owned()));
        }
    }

    Ok(Part {
        name,
        filename,
        content: &raw[offset..],
    })
}

fn parse_disposition(value: &str) -> Option<(&str, Option<&str>)> {
    let mut params = value.split(';').map(str::trim);
    if !params.next()?.eq_ignore_ascii_case("form-data") {
        return None;
    }

    let mut name = None;
    let mut filename = None;
    for param in params {
        if let Some((key, value)) = param.split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "name" => name = Some(value),
                "filename" => filename = Some(value),
                _ => {}
            }
        }
    }

    Some((name?, filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<'a>(body: &'a [u8], boundary: &str) -> Vec<Result<Part<'a>, MultipartError>> {
        Parts::new(body, boundary).collect()
    }

    #[test]
    fn single_file_part() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"x.txt\"\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            hello\r\n\
            --B--\r\n";
        let parts = collect(body, "B");
        assert_eq!(
            parts,
            vec![Ok(Part {
                name: "file",
                filename: Some("x.txt"),
                content: b"hello",
            })]
        );
    }

    #[test]
    fn fields_and_files_mixed() {
        let body = b"--xx\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\
            \r\n\
            My upload\r\n\
            --xx\r\n\
            Content-Disposition: form-data; name=\"a\"; filename=\"a.bin\"\r\n\
            \r\n\
            \x00\x01\r\n\x02\r\n\
            --xx--";
        let parts: Vec<_> = collect(body, "xx").into_iter().map(Result::unwrap).collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].content, b"My upload");
        assert_eq!(parts[1].filename, Some("a.bin"));
        assert_eq!(parts[1].content, b"\x00\x01\r\n\x02");
    }

    #[test]
    fn missing_closing_marker_is_an_error() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\nabc";
        assert_eq!(collect(body, "B"), vec![Err(MultipartError::Unterminated)]);
    }

    #[test]
    fn data_after_closing_marker_is_an_error() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\nabc\r\n--B--junk";
        let parts = collect(body, "B");
        assert!(parts[0].is_ok());
        assert_eq!(parts[1], Err(MultipartError::TrailingData));
    }

    #[test]
    fn wrong_opening_boundary() {
        assert_eq!(
            collect(b"--C\r\n\r\n--C--", "B"),
            vec![Err(MultipartError::MissingOpeningBoundary)]
        );
    }

    #[test]
    fn part_without_disposition_stops_iteration() {
        let body = b"--B\r\nContent-Type: text/plain\r\n\r\nabc\r\n--B\r\n\
            Content-Disposition: form-data; name=\"f\"\r\n\r\nx\r\n--B--";
        assert_eq!(collect(body, "B"), vec![Err(MultipartError::MissingDisposition)]);
    }

    #[test]
    fn path_like_file_names_are_rejected() {
        for name in ["../etc/passwd", "a/b.txt", "..", "c:\\x.txt"] {
            let body = format!(
                "--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"{name}\"\r\n\r\nx\r\n--B--"
            );
            let parts = collect(body.as_bytes(), "B");
            assert!(
                matches!(parts[0], Err(MultipartError::InvalidFilename(_))),
                "{name} accepted"
            );
        }
    }

    #[test]
    fn empty_filename_is_a_plain_field() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"\"\r\n\r\n\r\n--B--";
        let parts = collect(body, "B");
        assert_eq!(parts[0].as_ref().unwrap().filename, None);
    }

    #[test]
    fn boundary_parameter_extraction() {
        assert_eq!(
            boundary("multipart/form-data; charset=utf-8; boundary=----abc"),
            Some("----abc")
        );
        assert_eq!(boundary("multipart/form-data; boundary="), None);
    }
}
