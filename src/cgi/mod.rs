//! CGI/1.1 gateway ([RFC 3875]).
//!
//! The gateway is synchronous: [`run`] spawns the interpreter, feeds it the
//! request body, and blocks until the child exits. The whole server loop
//! waits with it.
//!
//! [RFC 3875]: https://www.rfc-editor.org/rfc/rfc3875

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{self, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use thiserror::Error;
use tracing::{debug, warn};

use crate::http::response::SERVER_SOFTWARE;
use crate::http::{Headers, Request, StatusCode};

const MAX_CGI_HEADERS: usize = 32;

/// Failures of the CGI gateway.
#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to start CGI program `{}`: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CGI pipe I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed CGI output: {0}")]
    Malformed(&'static str),
}

impl CgiError {
    /// The response status this failure maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Spawn { .. } => StatusCode::BadGateway,
            Self::Io(_) | Self::Malformed(_) => StatusCode::InternalServerError,
        }
    }
}

/// The parsed output of a CGI script.
#[derive(Debug)]
pub struct CgiOutput {
    pub status: StatusCode,
    /// Script headers except `Status` and `Content-Length`.
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Builds the CGI environment for `request`, whose script lives at `script`.
///
/// Each request header becomes `HTTP_<NAME>` with the name upper-cased.
pub fn build_env(request: &Request, script: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_owned(), value);
    };

    let server_name = if request.server_name().is_empty() {
        request.listen().to_string()
    } else {
        request.server_name().to_owned()
    };

    set("SERVER_SOFTWARE", SERVER_SOFTWARE.to_owned());
    set("SERVER_NAME", server_name);
    set("GATEWAY_INTERFACE", "CGI/1.1".to_owned());
    set("SERVER_PROTOCOL", "HTTP/1.1".to_owned());
    set("SERVER_PORT", request.listen().port.to_string());
    set("REQUEST_METHOD", request.method().as_str().to_owned());
    set("PATH_INFO", request.path().to_owned());
    set("PATH_TRANSLATED", script.display().to_string());
    set("SCRIPT_NAME", request.path().to_owned());
    set("SCRIPT_FILENAME", script.display().to_string());
    set("QUERY_STRING", request.query().to_owned());
    set("REMOTE_ADDR", request.client().ip().to_string());
    set("REMOTE_PORT", request.client().port().to_string());
    set("CONTENT_LENGTH", request.body().len().to_string());
    set("REDIRECT_STATUS", "200".to_owned());
    if let Some(content_type) = request.headers().get("Content-Type") {
        set("CONTENT_TYPE", content_type.to_owned());
    }

    for (name, value) in request.headers().iter() {
        set(&format!("HTTP_{}", name.to_ascii_uppercase()), value.to_owned());
    }

    env
}

/// Runs `script` with `program`, passing `input` on standard input.
///
/// The child sees only `env`, runs in the script's directory, and its
/// standard output is returned unparsed once it has exited.
pub fn run(
    program: &Path,
    script: &Path,
    env: &BTreeMap<String, String>,
    input: &[u8],
) -> Result<Vec<u8>, CgiError> {
    let program = path::absolute(program)?;
    let script = path::absolute(script)?;
    let workdir = script.parent().unwrap_or(Path::new("/"));

    debug!(program = %program.display(), script = %script.display(), "spawning CGI");
    let mut child = Command::new(&program)
        .arg(&script)
        .env_clear()
        .envs(env)
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| CgiError::Spawn {
            program: program.clone(),
            source,
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("child stdin was not captured"))?;

    // The body is written from a second thread so a script that writes
    // before draining its input cannot deadlock against us.
    let (written, output) = thread::scope(|scope| {
        let writer = scope.spawn(move || {
            let result = stdin.write_all(input);
            drop(stdin);
            result
        });
        let output = child.wait_with_output();
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("CGI stdin writer panicked")));
        (written, output)
    });

    let output = output?;
    match written {
        // scripts are free to ignore their input
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
        other => other?,
    }

    if output.status.success() {
        debug!(status = %output.status, bytes = output.stdout.len(), "CGI finished");
    } else {
        warn!(script = %script.display(), status = %output.status, "CGI exited unsuccessfully");
    }
    Ok(output.stdout)
}

/// Splits raw CGI output into status, headers and body.
///
/// A `Status` header sets the status code, otherwise a `Location` header
/// implies `302`, otherwise the status is `200`.
///
/// # Errors
///
/// [`CgiError::Malformed`] when the header block is unterminated or
/// unparseable, or `Status` names an unknown code.
pub fn parse_output(raw: &[u8]) -> Result<CgiOutput, CgiError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_CGI_HEADERS];
    let (offset, parsed) = match httparse::parse_headers(raw, &mut slots) {
        Ok(httparse::Status::Complete(done)) => done,
        Ok(httparse::Status::Partial) => {
            return Err(CgiError::Malformed("no blank line after the header block"));
        }
        Err(_) => return Err(CgiError::Malformed("unparseable header block")),
    };

    let mut status = None;
    let mut headers = Headers::with_capacity(parsed.len());
    for header in parsed {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| CgiError::Malformed("non UTF-8 header value"))?
            .trim();

        if header.name.eq_ignore_ascii_case("Status") {
            let code = value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .ok_or(CgiError::Malformed("invalid Status header"))?;
            status = Some(
                StatusCode::try_from(code)
                    .map_err(|_| CgiError::Malformed("unsupported Status code"))?,
            );
        } else if !header.name.eq_ignore_ascii_case("Content-Length") {
            headers.insert(header.name, value);
        }
    }

    let status = status.unwrap_or(if headers.contains("Location") {
        StatusCode::Found
    } else {
        StatusCode::Ok
    });

    Ok(CgiOutput {
        status,
        headers,
        body: raw[offset..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::config::{Listen, ServerConfig};

    fn request(raw: &str) -> Request {
        let listen = Listen::new("127.0.0.1", 8081);
        let config = ServerConfig {
            server_names: ["cgi.test".to_owned()].into(),
            listens: [listen.clone()].into(),
            ..ServerConfig::default()
        };
        let mut request = Request::new("10.1.2.3:5555".parse().unwrap(), listen);
        request.init(raw.as_bytes(), &[Arc::new(config)]);
        assert_eq!(request.status(), None);
        request
    }

    #[test]
    fn environment_follows_cgi_conventions() {
        let request = request(
            "POST /cgi/form.py?a=1 HTTP/1.1\r\nHost: cgi.test\r\nUser-Agent: curl/8\r\n\
             Content-Type: text/plain\r\nContent-Length: 4\r\n\r\nbody",
        );
        let env = build_env(&request, Path::new("/srv/www/cgi/form.py"));

        assert_eq!(env["GATEWAY_INTERFACE"], "CGI/1.1");
        assert_eq!(env["SERVER_PROTOCOL"], "HTTP/1.1");
        assert_eq!(env["SERVER_NAME"], "cgi.test");
        assert_eq!(env["SERVER_PORT"], "8081");
        assert_eq!(env["REQUEST_METHOD"], "POST");
        assert_eq!(env["SCRIPT_NAME"], "/cgi/form.py");
        assert_eq!(env["PATH_TRANSLATED"], "/srv/www/cgi/form.py");
        assert_eq!(env["QUERY_STRING"], "a=1");
        assert_eq!(env["REMOTE_ADDR"], "10.1.2.3");
        assert_eq!(env["REMOTE_PORT"], "5555");
        assert_eq!(env["CONTENT_LENGTH"], "4");
        assert_eq!(env["CONTENT_TYPE"], "text/plain");
        assert_eq!(env["HTTP_HOST"], "cgi.test");
        assert_eq!(env["HTTP_USER-AGENT"], "curl/8");
        assert!(env["SERVER_SOFTWARE"].starts_with("webserv/"));
    }

    #[test]
    fn output_with_status_header() {
        let out = parse_output(b"Status: 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 3\r\n\r\nnope")
            .unwrap();
        assert_eq!(out.status, StatusCode::NotFound);
        assert_eq!(out.headers.get("content-type"), Some("text/plain"));
        assert!(!out.headers.contains("Status"));
        assert!(!out.headers.contains("Content-Length"));
        assert_eq!(out.body, b"nope");
    }

    #[test]
    fn location_implies_found() {
        let out = parse_output(b"Location: /elsewhere\r\n\r\n").unwrap();
        assert_eq!(out.status, StatusCode::Found);
        assert_eq!(out.headers.get("Location"), Some("/elsewhere"));
    }

    #[test]
    fn default_status_is_ok() {
        let out = parse_output(b"Content-Type: text/html\n\n<p>hi</p>").unwrap();
        assert_eq!(out.status, StatusCode::Ok);
        assert_eq!(out.body, b"<p>hi</p>");
    }

    #[test]
    fn malformed_outputs() {
        for raw in [
            &b"just a body"[..],
            b"Content-Type: text/html\r\n",
            b"Status: abc\r\n\r\n",
            b"Status: 299\r\n\r\n",
            b"Bad Header\r\n\r\n",
        ] {
            assert!(
                matches!(parse_output(raw), Err(CgiError::Malformed(_))),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn gateway_errors_map_to_statuses() {
        let spawn = CgiError::Spawn {
            program: PathBuf::from("/nope"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(spawn.status(), StatusCode::BadGateway);
        assert_eq!(
            CgiError::Malformed("x").status(),
            StatusCode::InternalServerError
        );
    }

    #[cfg(unix)]
    #[test]
    fn runs_script_with_body_on_stdin_in_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo.sh");
        fs::write(
            &script,
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
             printf '%s|%s|' \"$REQUEST_METHOD\" \"$QUERY_STRING\"\n\
             cat\n\
             printf '|%s' \"$(pwd -P)\"\n",
        )
        .unwrap();

        let mut env = BTreeMap::new();
        env.insert("REQUEST_METHOD".to_owned(), "POST".to_owned());
        env.insert("QUERY_STRING".to_owned(), "x=1".to_owned());

        let raw = run(Path::new("/bin/sh"), &script, &env, b"payload").unwrap();
        let out = parse_output(&raw).unwrap();
        let cwd = fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            String::from_utf8(out.body).unwrap(),
            format!("POST|x=1|payload|{}", cwd.display())
        );
    }

    #[cfg(unix)]
    #[test]
    fn script_ignoring_stdin_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("quiet.sh");
        fs::write(&script, "printf 'Status: 204\\r\\n\\r\\n'\n").unwrap();

        let big = vec![b'x'; 1 << 20];
        let raw = run(Path::new("/bin/sh"), &script, &BTreeMap::new(), &big).unwrap();
        assert_eq!(parse_output(&raw).unwrap().status, StatusCode::NoContent);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("x.sh");
        fs::write(&script, "").unwrap();
        let err = run(
            &dir.path().join("no-such-interpreter"),
            &script,
            &BTreeMap::new(),
            b"",
        )
        .unwrap_err();
        assert!(matches!(err, CgiError::Spawn { .. }));
        assert_eq!(err.status(), StatusCode::BadGateway);
    }
}
