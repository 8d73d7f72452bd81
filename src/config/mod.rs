//! Configuration model: listen endpoints, virtual hosts and their locations.
//!
//! The records here are built once at startup and shared read-only for the
//! lifetime of the process. Two file formats produce them:
//!
//! - `*.json`: deserialized directly with `serde`;
//! - anything else: the nginx-like directive format handled by [`parser`].
//!
//! Both paths finish in [`ServerConfig::finalize`], which fills defaults and
//! rejects records the server cannot serve.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::Method;

pub mod parser;

pub use parser::ParseError;

/// Default `client_max_body_size` (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Default document root, relative to the working directory.
pub const DEFAULT_ROOT: &str = "html";

/// Default index file name.
pub const DEFAULT_INDEX: &str = "index.html";

/// Port used when a server block declares no `listen`.
pub const DEFAULT_PORT: u16 = 80;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("configuration declares no server")]
    Empty,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors produced when parsing a `listen` value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenError {
    #[error("invalid IPv4 address `{0}`")]
    Address(String),

    #[error("invalid port `{0}`, expected 1-65535")]
    Port(String),
}

/// An `(address, port)` pair a server binds and accepts connections on.
///
/// An empty address means every local IPv4 address. Ordering is by address,
/// then port, so a `BTreeSet<Listen>` deduplicates shared endpoints.
///
/// # Examples
///
/// ```
/// use webserv::config::Listen;
///
/// let listen: Listen = "127.0.0.1:8080".parse().unwrap();
/// assert_eq!(listen, Listen::new("127.0.0.1", 8080));
///
/// let any: Listen = "8080".parse().unwrap();
/// assert_eq!(any.address, "");
/// assert_eq!(any.to_string(), "0.0.0.0:8080");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Listen {
    pub address: String,
    pub port: u16,
}

impl Listen {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Socket address to bind, mapping the empty address to `0.0.0.0`.
    pub fn socket_addr(&self) -> Result<SocketAddrV4, ListenError> {
        let ip = if self.address.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            self.address
                .parse()
                .map_err(|_| ListenError::Address(self.address.clone()))?
        };
        Ok(SocketAddrV4::new(ip, self.port))
    }
}

impl fmt::Display for Listen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.is_empty() {
            write!(f, "0.0.0.0:{}", self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl FromStr for Listen {
    type Err = ListenError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (address, port) = match value.rsplit_once(':') {
            Some((address, port)) => {
                address
                    .parse::<Ipv4Addr>()
                    .map_err(|_| ListenError::Address(address.to_owned()))?;
                (address, port)
            }
            None => ("", value),
        };

        let port = match port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(ListenError::Port(port.to_owned())),
        };

        Ok(Self::new(address, port))
    }
}

impl TryFrom<String> for Listen {
    type Error = ListenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Listen> for String {
    fn from(listen: Listen) -> String {
        if listen.address.is_empty() {
            listen.port.to_string()
        } else {
            format!("{}:{}", listen.address, listen.port)
        }
    }
}

/// A path-prefix scoped override inside a [`ServerConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocationConfig {
    /// The path prefix this location applies to, e.g. `/images`.
    pub location: String,
    pub root: Option<String>,
    pub index: Option<String>,
    pub allow_methods: BTreeSet<Method>,
    /// Interpreter or binary that runs scripts under this location.
    pub cgi_path: Option<PathBuf>,
    /// Script extension including the dot, e.g. `.py`.
    pub cgi_extension: Option<String>,
    pub autoindex: bool,
    pub redirect: Option<String>,
}

impl LocationConfig {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    /// The location root, falling back to the owning server's.
    pub fn effective_root<'a>(&'a self, server: &'a ServerConfig) -> &'a str {
        self.root.as_deref().unwrap_or(&server.root)
    }

    /// The location index file, falling back to the owning server's.
    pub fn effective_index<'a>(&'a self, server: &'a ServerConfig) -> &'a str {
        self.index.as_deref().unwrap_or(&server.index)
    }

    pub fn allows(&self, method: Method) -> bool {
        self.allow_methods.contains(&method)
    }

    fn finalize(&mut self, server_methods: &BTreeSet<Method>) -> Result<(), ConfigError> {
        if !self.location.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "location `{}` must start with `/`",
                self.location
            )));
        }

        if let Some(extension) = &self.cgi_extension {
            if !extension.starts_with('.') || extension.len() < 2 {
                return Err(ConfigError::Invalid(format!(
                    "location `{}`: cgi_extension `{extension}` must look like `.ext`",
                    self.location
                )));
            }
        }

        if self.allow_methods.is_empty() {
            self.allow_methods = server_methods.clone();
        }

        Ok(())
    }
}

/// One virtual host: its endpoints, names, defaults and locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub server_names: BTreeSet<String>,
    pub listens: BTreeSet<Listen>,
    pub root: String,
    pub index: String,
    pub allow_methods: BTreeSet<Method>,
    #[serde(with = "location_list")]
    pub locations: BTreeMap<String, LocationConfig>,
    pub client_max_body_size: usize,
    /// Custom error page per status code, relative to `root`.
    pub error_pages: BTreeMap<u16, PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_names: BTreeSet::new(),
            listens: BTreeSet::new(),
            root: String::new(),
            index: String::new(),
            allow_methods: BTreeSet::new(),
            locations: BTreeMap::new(),
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            error_pages: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Adds a location, returning `false` if its path is already taken.
    pub fn add_location(&mut self, location: LocationConfig) -> bool {
        if self.locations.contains_key(&location.location) {
            return false;
        }
        self.locations.insert(location.location.clone(), location);
        true
    }

    /// The name used when no `Host` matched exactly; empty when unnamed.
    pub fn first_server_name(&self) -> &str {
        self.server_names.iter().next().map_or("", String::as_str)
    }

    /// Fills unset fields with defaults and validates the record.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the server declares no location,
    /// a location path is not absolute, or a listen address is not IPv4.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.listens.is_empty() {
            self.listens.insert(Listen::new("", DEFAULT_PORT));
        }
        if self.root.is_empty() {
            self.root = DEFAULT_ROOT.to_owned();
        }
        if self.index.is_empty() {
            self.index = DEFAULT_INDEX.to_owned();
        }
        if self.allow_methods.is_empty() {
            self.allow_methods = Method::KNOWN.into_iter().collect();
        }
        if self.locations.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "server `{}` declares no location",
                self.first_server_name()
            )));
        }

        for listen in &self.listens {
            listen
                .socket_addr()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        for code in self.error_pages.keys() {
            if !(300..=599).contains(code) {
                return Err(ConfigError::Invalid(format!(
                    "error_page code {code} is outside 300-599"
                )));
            }
        }

        let methods = self.allow_methods.clone();
        for location in self.locations.values_mut() {
            location.finalize(&methods)?;
        }

        Ok(())
    }
}

// Locations are written as a list in JSON and keyed by their path in memory.
mod location_list {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::LocationConfig;

    pub fn serialize<S: Serializer>(
        locations: &BTreeMap<String, LocationConfig>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(locations.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, LocationConfig>, D::Error> {
        let mut locations = BTreeMap::new();
        for location in Vec::<LocationConfig>::deserialize(deserializer)? {
            let key = location.location.clone();
            if locations.insert(key.clone(), location).is_some() {
                return Err(D::Error::custom(format!("duplicate location `{key}`")));
            }
        }
        Ok(locations)
    }
}

/// Loads and validates the server list from `path`.
///
/// Files ending in `.json` are read as a JSON array of server records; every
/// other file is read in the directive format.
pub fn load(path: &Path) -> Result<Vec<ServerConfig>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;

    if path.extension().is_some_and(|ext| ext == "json") {
        from_json(&text)
    } else {
        from_directives(&text)
    }
}

/// Parses a JSON array of server records and applies defaults.
pub fn from_json(text: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    let servers: Vec<ServerConfig> = serde_json::from_str(text)?;
    finalize_all(servers)
}

/// Parses the directive format and applies defaults.
pub fn from_directives(text: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    let servers = parser::parse(text)?;
    finalize_all(servers)
}

fn finalize_all(mut servers: Vec<ServerConfig>) -> Result<Vec<ServerConfig>, ConfigError> {
    if servers.is_empty() {
        return Err(ConfigError::Empty);
    }
    for server in &mut servers {
        server.finalize()?;
    }
    Ok(servers)
}
