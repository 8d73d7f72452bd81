//! The response engine: turns one completed [`Request`] into response bytes.
//!
//! Processing runs in a fixed order. Location resolution comes first, then
//! method and CGI gating, then redirect. After that a CGI dispatch or the
//! method itself runs: static files, autoindex, uploads or delete. Any
//! failure along the way becomes a status code that is rendered through
//! the server's custom error page or a generated one.

use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{self, Path};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use html_escape::{encode_double_quoted_attribute, encode_text};
use tracing::{debug, error, info, warn};

use crate::cgi;
use crate::config::{LocationConfig, ServerConfig};
use crate::http::{Method, Request, Response, StatusCode, mime};
use crate::router;

/// Name of the cookie set on every non-CGI response.
pub const TIMESTAMP_COOKIE: &str = "timestamp";

/// Lifetime of the timestamp cookie, in seconds.
pub const TIMESTAMP_MAX_AGE: u64 = 30;

/// Builds the response for one completed request.
///
/// The engine borrows the request mutably because multipart uploads record
/// the names of the files they write on it.
pub struct ResponseEngine<'a> {
    request: &'a mut Request,
    server: Option<Arc<ServerConfig>>,
    /// The CGI program produced output we could not parse.
    cgi_error: bool,
    /// The error body came from a configured error page.
    custom_error: bool,
    /// The response was produced by a CGI script.
    from_cgi: bool,
}

impl<'a> ResponseEngine<'a> {
    pub fn new(request: &'a mut Request) -> Self {
        let server = request.server_config().cloned();
        Self {
            request,
            server,
            cgi_error: false,
            custom_error: false,
            from_cgi: false,
        }
    }

    /// Runs the request to completion and serializes the response.
    ///
    /// A panic while building the response is turned into `500`.
    pub fn process(mut self) -> BytesMut {
        let mut response = match self.request.status() {
            Some(status) => self.error_response(status),
            None => match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch())) {
                Ok(Ok(response)) => response,
                Ok(Err(status)) => self.error_response(status),
                Err(_) => {
                    error!(
                        peer = %self.request.client(),
                        path = self.request.path(),
                        "panic while building response"
                    );
                    self.from_cgi = false;
                    self.error_response(StatusCode::InternalServerError)
                }
            },
        };

        if !self.from_cgi && self.request.cookie(TIMESTAMP_COOKIE).is_none() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs());
            response.add_header(
                "Set-Cookie",
                format!("{TIMESTAMP_COOKIE}={now}; Max-Age={TIMESTAMP_MAX_AGE}"),
            );
        }

        info!(
            peer = %self.request.client(),
            method = %self.request.method(),
            path = self.request.path(),
            status = response.status().as_u16(),
            cgi_error = self.cgi_error,
            custom_error = self.custom_error,
            "response"
        );

        response
            .without_body(self.request.method() == Method::Head)
            .into_bytes()
    }

    fn dispatch(&mut self) -> Result<Response, StatusCode> {
        // a request without a resolved server always carries a status
        let server = self.server.clone().ok_or(StatusCode::InternalServerError)?;
        let path = self.request.path().to_owned();
        let method = self.request.method();

        let location = router::resolve(&server, &path).ok_or(StatusCode::NotFound)?;
        debug!(path = %path, location = %location.location, "location resolved");

        if !location.allows(method) {
            return Err(StatusCode::MethodNotAllowed);
        }
        if let Some(cgi_path) = &location.cgi_path {
            if !is_executable(cgi_path) {
                warn!(cgi_path = %cgi_path.display(), "CGI program is not executable");
                return Err(StatusCode::NotFound);
            }
            let extension_ok = location
                .cgi_extension
                .as_deref()
                .is_none_or(|extension| router::has_extension(&path, extension));
            if !extension_ok {
                return Err(StatusCode::Forbidden);
            }
        }

        if let Some(redirect) = &location.redirect {
            let encoded = router::encode_path(&path);
            let target = router::redirect_location(location, redirect, &encoded);
            return Ok(Response::new(StatusCode::Found).header("Location", target));
        }

        let target = router::target_path(location.effective_root(&server), &path)?;

        if let Some(cgi_path) = &location.cgi_path {
            return self.run_cgi(cgi_path, &target);
        }

        match method {
            Method::Get | Method::Head => self.get(&server, location, &target),
            Method::Post => self.post(&target),
            Method::Delete => delete(&target),
            _ => Err(StatusCode::NotImplemented),
        }
    }

    fn run_cgi(&mut self, program: &Path, script: &Path) -> Result<Response, StatusCode> {
        if !script.is_file() {
            return Err(StatusCode::NotFound);
        }
        let script = path::absolute(script).map_err(|_| StatusCode::InternalServerError)?;

        let env = cgi::build_env(self.request, &script);
        let raw = cgi::run(program, &script, &env, self.request.body()).map_err(|e| {
            warn!(script = %script.display(), error = %e, "CGI gateway failed");
            e.status()
        })?;

        let output = cgi::parse_output(&raw).map_err(|e| {
            warn!(script = %script.display(), error = %e, "CGI gateway failed");
            self.cgi_error = true;
            e.status()
        })?;

        self.from_cgi = true;
        let mut response = Response::new(output.status);
        if !output.headers.contains("Content-Type") {
            response.add_header("Content-Type", "text/html");
        }
        for (name, value) in output.headers.iter() {
            response.add_header(name, value);
        }
        Ok(response.body_bytes(output.body))
    }

    fn get(
        &self,
        server: &ServerConfig,
        location: &LocationConfig,
        target: &Path,
    ) -> Result<Response, StatusCode> {
        if target.is_file() {
            return serve_file(target);
        }
        if target.is_dir() {
            if location.autoindex {
                return autoindex(target, self.request.path());
            }
            let index = target.join(location.effective_index(server));
            if index.is_file() {
                return serve_file(&index);
            }
        }
        Err(StatusCode::NotFound)
    }

    fn post(&mut self, target: &Path) -> Result<Response, StatusCode> {
        if !self.request.is_multipart() {
            return Err(StatusCode::UnsupportedMediaType);
        }
        if !target.is_dir() {
            return Err(StatusCode::NotFound);
        }

        self.request.write_files(target)?;

        let Some(first) = self.request.uploaded_files().first() else {
            return Ok(Response::new(StatusCode::Ok));
        };
        let base = self.request.path().trim_end_matches('/');
        let location = router::encode_path(&format!("{base}/{first}"));

        let mut body = String::from("<html>\n<body>\n<ul>\n");
        for name in self.request.uploaded_files() {
            let href = router::encode_path(&format!("{base}/{name}"));
            let _ = writeln!(
                body,
                "<li><a href=\"{}\">{}</a></li>",
                encode_double_quoted_attribute(&href),
                encode_text(name)
            );
        }
        body.push_str("</ul>\n</body>\n</html>");

        Ok(Response::new(StatusCode::Created)
            .header("Location", location)
            .header("Content-Type", "text/html")
            .body(body))
    }

    /// Renders `status` through the server's error page for it, if one is
    /// configured and readable, or a generated HTML page.
    fn error_response(&mut self, status: StatusCode) -> Response {
        if let Some(server) = &self.server {
            if let Some(page) = server.error_pages.get(&status.as_u16()) {
                let page = Path::new(&server.root).join(page);
                match fs::read(&page) {
                    Ok(body) => {
                        self.custom_error = true;
                        return Response::new(status)
                            .header("Content-Type", mime::from_path(&page))
                            .body_bytes(body);
                    }
                    Err(e) => {
                        warn!(page = %page.display(), error = %e, "error page unreadable");
                    }
                }
            }
        }

        Response::new(status)
            .header("Content-Type", "text/html")
            .body(error_page(status))
    }
}

/// The generated body for an error status.
pub fn error_page(status: StatusCode) -> String {
    let message = status.canonical_reason();
    format!(
        "<html>\n<head><title>{code} {message}</title></head>\n\
         <body><center><h1>{code} {message}</h1></center></body>\n</html>",
        code = status.as_u16()
    )
}

fn serve_file(path: &Path) -> Result<Response, StatusCode> {
    let body = fs::read(path).map_err(|e| {
        debug!(path = %path.display(), error = %e, "file unreadable");
        StatusCode::Forbidden
    })?;
    Ok(Response::new(StatusCode::Ok)
        .header("Content-Type", mime::from_path(path))
        .body_bytes(body))
}

/// Lists the entries of `dir` as links relative to `request_path`.
fn autoindex(dir: &Path, request_path: &str) -> Result<Response, StatusCode> {
    let entries = fs::read_dir(dir).map_err(|e| {
        warn!(dir = %dir.display(), error = %e, "cannot list directory");
        StatusCode::InternalServerError
    })?;

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort();

    let base = if request_path.ends_with('/') {
        request_path.to_owned()
    } else {
        format!("{request_path}/")
    };
    let title = encode_text(&base);
    let href_base = router::encode_path(&base);

    let mut body = format!(
        "<html>\n<head><title>Index of {title}</title></head>\n<body>\n<h1>Index of {title}</h1>\n<hr>\n<ul>\n"
    );
    if base != "/" {
        body.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for name in &names {
        let href = format!("{href_base}{}", router::encode_path(name));
        let _ = writeln!(
            body,
            "<li><a href=\"{}\">{}</a></li>",
            encode_double_quoted_attribute(&href),
            encode_text(name)
        );
    }
    body.push_str("</ul>\n<hr>\n</body>\n</html>");

    Ok(Response::new(StatusCode::Ok)
        .header("Content-Type", "text/html")
        .body(body))
}

fn delete(target: &Path) -> Result<Response, StatusCode> {
    let removed = match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir(target),
        Ok(_) => fs::remove_file(target),
        Err(e) => Err(e),
    };
    match removed {
        Ok(()) => {
            info!(path = %target.display(), "deleted");
            Ok(Response::new(StatusCode::NoContent))
        }
        Err(e) => {
            debug!(path = %target.display(), error = %e, "delete failed");
            Err(StatusCode::Forbidden)
        }
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::config::Listen;

    struct Site {
        dir: tempfile::TempDir,
        configs: Vec<Arc<ServerConfig>>,
    }

    fn site(configure: impl FnOnce(&mut ServerConfig)) -> Site {
        let dir = tempfile::tempdir().unwrap();
        let mut server = ServerConfig {
            server_names: ["localhost".to_owned()].into(),
            listens: [Listen::new("127.0.0.1", 8080)].into(),
            root: dir.path().display().to_string(),
            ..ServerConfig::default()
        };
        server.add_location(LocationConfig::new("/"));
        configure(&mut server);
        server.finalize().unwrap();
        Site {
            dir,
            configs: vec![Arc::new(server)],
        }
    }

    impl Site {
        fn write(&self, relative: &str, contents: &str) {
            let path = self.dir.path().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }

        fn respond(&self, raw: &str) -> String {
            let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
            let mut request = Request::new(client, Listen::new("127.0.0.1", 8080));
            request.feed(raw.as_bytes(), &self.configs);
            assert!(request.is_complete());
            let bytes = ResponseEngine::new(&mut request).process();
            String::from_utf8_lossy(&bytes).into_owned()
        }

        fn get(&self, path: &str) -> String {
            self.respond(&format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"))
        }
    }

    fn status(response: &str) -> u16 {
        response[9..12].parse().unwrap()
    }

    fn header<'r>(response: &'r str, name: &str) -> Option<&'r str> {
        let head = response.split("\r\n\r\n").next()?;
        head.split("\r\n")
            .filter_map(|line| line.split_once(": "))
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    fn body(response: &str) -> &str {
        response.split_once("\r\n\r\n").map_or("", |(_, body)| body)
    }

    #[test]
    fn serves_index_file() {
        let site = site(|_| {});
        site.write("index.html", "<h1>home</h1>");
        let response = site.get("/");
        assert_eq!(status(&response), 200);
        assert_eq!(header(&response, "Content-Type"), Some("text/html"));
        assert_eq!(body(&response), "<h1>home</h1>");
    }

    #[test]
    fn serves_file_with_mime_type() {
        let site = site(|_| {});
        site.write("css/site.css", "body{}");
        let response = site.get("/css/site.css");
        assert_eq!(status(&response), 200);
        assert_eq!(header(&response, "Content-Type"), Some("text/css"));
        assert_eq!(header(&response, "Content-Length"), Some("6"));
    }

    #[test]
    fn autoindex_lists_entries() {
        let site = site(|server| {
            server.locations.get_mut("/").unwrap().autoindex = true;
        });
        site.write("a.txt", "a");
        site.write("sub/b.txt", "b");
        let response = site.get("/");
        assert_eq!(status(&response), 200);
        assert_eq!(header(&response, "Content-Type"), Some("text/html"));
        assert!(body(&response).contains("<a href=\"/a.txt\">a.txt</a>"));
        assert!(body(&response).contains("<a href=\"/sub/\">sub/</a>"));

        let nested = site.get("/sub");
        assert!(body(&nested).contains("<a href=\"/sub/b.txt\">b.txt</a>"));
        assert!(body(&nested).contains("../"));
    }

    #[test]
    fn autoindex_links_resolve_for_awkward_names() {
        let site = site(|server| {
            server.locations.get_mut("/").unwrap().autoindex = true;
        });
        site.write("my file#1.txt", "spaced");
        site.write("a&b/<c>.txt", "nested");

        let listing = body(&site.get("/")).to_owned();
        assert!(
            listing.contains("<a href=\"/my%20file%231.txt\">my file#1.txt</a>"),
            "{listing}"
        );
        assert!(listing.contains("<a href=\"/a&amp;b/\">a&amp;b/</a>"), "{listing}");

        let followed = site.get("/my%20file%231.txt");
        assert_eq!(status(&followed), 200);
        assert_eq!(body(&followed), "spaced");

        let nested = site.get("/a&b/");
        assert!(
            body(&nested).contains("<a href=\"/a&amp;b/%3Cc%3E.txt\">&lt;c&gt;.txt</a>"),
            "{}",
            body(&nested)
        );
        assert_eq!(body(&site.get("/a&b/%3Cc%3E.txt")), "nested");
    }

    #[test]
    fn encoded_parent_segments_are_forbidden() {
        let site = site(|_| {});
        assert_eq!(status(&site.get("/%2e%2e/etc/passwd")), 403);
    }

    #[test]
    fn missing_file_is_not_found() {
        let site = site(|_| {});
        let response = site.get("/missing.html");
        assert_eq!(status(&response), 404);
        assert!(body(&response).contains("404 Not Found"));
    }

    #[test]
    fn parent_segments_are_forbidden() {
        let site = site(|_| {});
        assert_eq!(status(&site.get("/../etc/passwd")), 403);
    }

    #[test]
    fn method_not_in_location_allow_list() {
        let site = site(|server| {
            let mut api = LocationConfig::new("/api");
            api.allow_methods = [Method::Get].into();
            server.add_location(api);
        });
        let response = site.respond("DELETE /api/x HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(status(&response), 405);
    }

    #[test]
    fn unsupported_method_is_not_implemented() {
        let site = site(|_| {});
        let response = site.respond("OPTIONS / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(status(&response), 501);
    }

    #[test]
    fn redirect_substitutes_location_prefix() {
        let site = site(|server| {
            let mut old = LocationConfig::new("/old");
            old.redirect = Some("/new".to_owned());
            server.add_location(old);
        });
        let response = site.get("/old/page.html");
        assert_eq!(status(&response), 302);
        assert_eq!(header(&response, "Location"), Some("/new/page.html"));
    }

    #[test]
    fn head_omits_body() {
        let site = site(|_| {});
        site.write("index.html", "12345");
        let response = site.respond("HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(status(&response), 200);
        assert_eq!(header(&response, "Content-Length"), Some("5"));
        assert_eq!(body(&response), "");
    }

    #[test]
    fn delete_file_then_missing() {
        let site = site(|_| {});
        site.write("gone.txt", "x");
        let first = site.respond("DELETE /gone.txt HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(status(&first), 204);
        assert!(!site.dir.path().join("gone.txt").exists());
        let second = site.respond("DELETE /gone.txt HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(status(&second), 403);
    }

    #[test]
    fn multipart_upload_creates_file() {
        let site = site(|_| {});
        fs::create_dir(site.dir.path().join("uploads")).unwrap();
        let body = "--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\r\nhello\r\n--B--\r\n";
        let response = site.respond(&format!(
            "POST /uploads HTTP/1.1\r\nHost: localhost\r\n\
             Content-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ));
        assert_eq!(status(&response), 201);
        assert_eq!(header(&response, "Location"), Some("/uploads/x.txt"));
        assert_eq!(
            fs::read_to_string(site.dir.path().join("uploads/x.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn post_without_multipart_is_unsupported() {
        let site = site(|_| {});
        let response = site.respond(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi",
        );
        assert_eq!(status(&response), 415);
    }

    #[test]
    fn custom_error_page_is_served() {
        let site = site(|server| {
            server.error_pages.insert(404, "errors/404.html".into());
        });
        site.write("errors/404.html", "<p>custom missing</p>");
        let response = site.get("/nothing");
        assert_eq!(status(&response), 404);
        assert_eq!(body(&response), "<p>custom missing</p>");
    }

    #[test]
    fn unreadable_custom_error_page_falls_back() {
        let site = site(|server| {
            server.error_pages.insert(404, "errors/none.html".into());
        });
        let response = site.get("/nothing");
        assert!(body(&response).contains("<h1>404 Not Found</h1>"));
    }

    #[test]
    fn terminal_request_status_short_circuits() {
        let site = site(|_| {});
        let response = site.respond("GET / HTTP/1.0\r\nHost: localhost\r\n\r\n");
        assert_eq!(status(&response), 400);
        assert_eq!(header(&response, "Connection"), Some("close"));
    }

    #[test]
    fn timestamp_cookie_unless_present() {
        let site = site(|_| {});
        site.write("index.html", "x");
        let fresh = site.get("/");
        let cookie = header(&fresh, "Set-Cookie").unwrap();
        assert!(cookie.starts_with("timestamp="));
        assert!(cookie.ends_with("; Max-Age=30"));

        let returning =
            site.respond("GET / HTTP/1.1\r\nHost: localhost\r\nCookie: timestamp=1\r\n\r\n");
        assert_eq!(header(&returning, "Set-Cookie"), None);
    }

    #[cfg(unix)]
    mod cgi_locations {
        use super::*;

        fn cgi_site(program: &str) -> Site {
            let program = program.to_owned();
            site(move |server| {
                let mut location = LocationConfig::new("/cgi");
                location.cgi_path = Some(program.into());
                location.cgi_extension = Some(".sh".to_owned());
                server.add_location(location);
            })
        }

        #[test]
        fn script_output_is_relayed() {
            let site = cgi_site("/bin/sh");
            site.write(
                "cgi/hello.sh",
                "printf 'Content-Type: text/plain\\r\\nX-Script: yes\\r\\n\\r\\n'\nprintf '%s' \"$QUERY_STRING\"\n",
            );
            let response = site.get("/cgi/hello.sh?name=web");
            assert_eq!(status(&response), 200);
            assert_eq!(header(&response, "Content-Type"), Some("text/plain"));
            assert_eq!(header(&response, "X-Script"), Some("yes"));
            assert_eq!(header(&response, "Set-Cookie"), None);
            assert_eq!(body(&response), "name=web");
        }

        #[test]
        fn wrong_extension_is_forbidden() {
            let site = cgi_site("/bin/sh");
            site.write("cgi/page.html", "x");
            assert_eq!(status(&site.get("/cgi/page.html")), 403);
        }

        #[test]
        fn missing_script_is_not_found() {
            let site = cgi_site("/bin/sh");
            assert_eq!(status(&site.get("/cgi/none.sh")), 404);
        }

        #[test]
        fn missing_interpreter_is_not_found() {
            let site = cgi_site("/no/such/interpreter");
            site.write("cgi/x.sh", "");
            assert_eq!(status(&site.get("/cgi/x.sh")), 404);
        }

        #[test]
        fn malformed_output_is_internal_error() {
            let site = cgi_site("/bin/sh");
            site.write("cgi/bad.sh", "printf 'no header block'\n");
            let response = site.get("/cgi/bad.sh");
            assert_eq!(status(&response), 500);
            assert_eq!(header(&response, "Content-Type"), Some("text/html"));
        }
    }
}
