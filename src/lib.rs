//! # webserv
//!
//! A single-process, readiness-driven HTTP/1.1 server. It serves static
//! files, directory listings, redirects, multipart uploads and CGI scripts
//! for any number of virtual hosts described by an nginx-like configuration
//! file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webserv::{config, server::Server};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let configs = config::from_directives(
//!         "server {
//!              listen 127.0.0.1:8080;
//!              root www;
//!              location / { autoindex on; }
//!          }",
//!     )?;
//!     let mut server = Server::new(configs)?;
//!     server.install_signal_handlers()?;
//!     server.init()?;
//!     server.run()?;
//!     Ok(())
//! }
//! ```
//!
//! Every connection carries exactly one request and is closed after the
//! response; there is no keep-alive, TLS or chunked transfer coding.

#[cfg(not(unix))]
compile_error!("webserv needs epoll or kqueue and only builds on Unix targets");

pub mod cgi;
pub mod config;
pub mod engine;
pub mod http;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, Listen, LocationConfig, ServerConfig};
pub use engine::ResponseEngine;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError, ShutdownHandle};
