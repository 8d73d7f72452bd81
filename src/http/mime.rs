//! Content types for served files, guessed from the file extension.

use std::path::Path;

/// Type served for files whose extension is unknown.
pub const DEFAULT: &str = "text/plain";

/// Returns the MIME type for `path`'s extension, [`DEFAULT`] when unknown.
///
/// ```
/// use std::path::Path;
/// use webserv::http::mime;
///
/// assert_eq!(mime::from_path(Path::new("www/index.html")), "text/html");
/// assert_eq!(mime::from_path(Path::new("photo.JPG")), "image/jpeg");
/// assert_eq!(mime::from_path(Path::new("Makefile")), "text/plain");
/// ```
pub fn from_path(path: &Path) -> &'static str {
    mime_guess::from_path(path).first_raw().unwrap_or(DEFAULT)
}
