//! Location routing: map a request path to the [`LocationConfig`] that governs it
//! and to the filesystem path it names.
//!
//! Locations are matched by longest path prefix, aligned on `/` boundaries. The
//! request path is normalized to end with `/`, then every `/`-terminated prefix
//! is tried from longest to shortest, each with and without its trailing slash:
//!
//! | Locations         | Request path     | Matched location |
//! |-------------------|------------------|------------------|
//! | `/`, `/a/b`       | `/a/b/c`         | `/a/b`           |
//! | `/`, `/a/b`       | `/a/x`           | `/`              |
//! | `/`, `/a/b`       | `/a/bc`          | `/`              |
//! | `/img/`           | `/img`           | `/img/`          |
//!
//! The first prefix present in the server's location table wins.
//!
//! Matching stops at segment boundaries instead of shrinking the
//! path one byte at a time, so location `/a/b` does not capture `/a/bc`.
//!
//! Request paths reach this module percent-decoded; [`encode_path`] turns a
//! decoded path back into its URL form for generated links and headers.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use crate::config::{LocationConfig, ServerConfig};
use crate::http::StatusCode;

// Bytes that cannot appear literally in a URL path. `/` is kept.
const PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Finds the location with the longest prefix of `path`.
///
/// Returns `None` when not even `/` is configured.
///
/// # Examples
///
/// ```
/// use webserv::config::{LocationConfig, ServerConfig};
/// use webserv::router;
///
/// let mut server = ServerConfig::default();
/// server.add_location(LocationConfig::new("/"));
/// server.add_location(LocationConfig::new("/a/b"));
///
/// assert_eq!(router::resolve(&server, "/a/b/c").unwrap().location, "/a/b");
/// assert_eq!(router::resolve(&server, "/a/x").unwrap().location, "/");
/// ```
pub fn resolve<'a>(server: &'a ServerConfig, path: &str) -> Option<&'a LocationConfig> {
    let normalized: Cow<'_, str> = if path.ends_with('/') {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(format!("{path}/"))
    };

    normalized.rmatch_indices('/').find_map(|(i, _)| {
        let with_slash = &normalized[..=i];
        let without_slash = &normalized[..i];
        server.locations.get(with_slash).or_else(|| {
            if without_slash.is_empty() {
                None
            } else {
                server.locations.get(without_slash)
            }
        })
    })
}

/// Joins the request path onto `root`.
///
/// A path with a `..` segment would escape the root and yields `403`.
///
/// ```
/// use std::path::Path;
/// use webserv::router::target_path;
///
/// assert_eq!(target_path("www", "/docs/a.html").unwrap(), Path::new("www/docs/a.html"));
/// assert!(target_path("www", "/docs/../../etc/passwd").is_err());
/// ```
pub fn target_path(root: &str, path: &str) -> Result<PathBuf, StatusCode> {
    if path.split('/').any(|segment| segment == "..") {
        return Err(StatusCode::Forbidden);
    }
    Ok(Path::new(root).join(path.trim_start_matches('/')))
}

/// Builds a redirect `Location` by substituting the location prefix of `path`
/// with `redirect`.
pub fn redirect_location(location: &LocationConfig, redirect: &str, path: &str) -> String {
    match path.strip_prefix(location.location.as_str()) {
        Some(rest) if redirect.ends_with('/') => {
            format!("{redirect}{}", rest.trim_start_matches('/'))
        }
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') => {
            format!("{redirect}/{rest}")
        }
        Some(rest) => format!("{redirect}{rest}"),
        // `/img` matched by location `/img/`
        None => redirect.to_owned(),
    }
}

/// Percent-encodes a decoded path for use in a link or `Location` header.
///
/// ```
/// use webserv::router::encode_path;
///
/// assert_eq!(encode_path("/docs/my file#1.txt"), "/docs/my%20file%231.txt");
/// assert_eq!(encode_path("/a/b.html"), "/a/b.html");
/// ```
pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH).to_string()
}

/// Returns `true` when `path` ends with the CGI `extension` (given with its dot).
pub fn has_extension(path: &str, extension: &str) -> bool {
    path.len() > extension.len() && path.ends_with(extension)
}
