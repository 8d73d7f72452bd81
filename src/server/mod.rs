//! Single-threaded, readiness-driven connection server.
//!
//! One thread owns every socket. Listening sockets and client sockets live in
//! two tables keyed by descriptor; the [`Multiplexer`] reports which of them
//! are ready and [`Server::run`] dispatches each event by priority:
//! error, peer EOF, accept, read, write. Every connection carries exactly
//! one request and is closed once its response has been flushed.
//!
//! CGI scripts run synchronously inside the loop, so a slow script stalls
//! every connection until it exits.

pub mod poll;
pub mod signal;

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use self::poll::{Event, MAX_EVENTS, Multiplexer, Poller};
pub use self::signal::{Shutdown, ShutdownHandle};
use crate::config::{Listen, ListenError, ServerConfig};
use crate::engine::ResponseEngine;
use crate::http::Request;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {listen}: {source}")]
    Bind {
        listen: Listen,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {listen}: {source}")]
    Listen {
        listen: Listen,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Address(#[from] ListenError),

    #[error("readiness multiplexer failed: {0}")]
    Multiplexer(#[source] io::Error),

    #[error("no server block configured")]
    NoServers,
}

/// Pending connections queued per listening socket.
const LISTEN_BACKLOG: i32 = 100;

/// Bytes read from a client per readiness event.
const READ_BUFFER_SIZE: usize = 2048;

// Per-connection state. The request is complete once the fd has been moved
// to write readiness; `pending` holds the serialized response and how much
// of it has been sent.
struct Client {
    stream: TcpStream,
    request: Request,
    pending: Option<(BytesMut, usize)>,
}

/// The webserv connection server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::path::Path;
/// use webserv::{config, server::Server};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let configs = config::load(Path::new("conf/default.conf"))?;
///     let mut server = Server::new(configs)?;
///     server.install_signal_handlers()?;
///     server.init()?;
///     server.run()?;
///     Ok(())
/// }
/// ```
pub struct Server {
    configs: Vec<Arc<ServerConfig>>,
    poller: Poller,
    listeners: HashMap<RawFd, (Socket, Listen)>,
    clients: HashMap<RawFd, Client>,
    shutdown: Shutdown,
}

impl Server {
    /// Creates the multiplexer and shutdown pipe for `configs`.
    ///
    /// # Errors
    ///
    /// [`ServerError::NoServers`] for an empty configuration and
    /// [`ServerError::Multiplexer`] when the readiness facility cannot be created.
    pub fn new(configs: Vec<ServerConfig>) -> Result<Self, ServerError> {
        if configs.is_empty() {
            return Err(ServerError::NoServers);
        }
        Ok(Self {
            configs: configs.into_iter().map(Arc::new).collect(),
            poller: Poller::new().map_err(ServerError::Multiplexer)?,
            listeners: HashMap::new(),
            clients: HashMap::new(),
            shutdown: Shutdown::new()?,
        })
    }

    /// Stops the server on SIGINT, SIGQUIT and SIGTERM.
    pub fn install_signal_handlers(&mut self) -> Result<(), ServerError> {
        Ok(self.shutdown.install_signal_handlers()?)
    }

    /// A handle that stops [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.handle()
    }

    /// Creates and binds one socket per distinct listen across all server
    /// blocks and registers it with the multiplexer.
    ///
    /// # Errors
    ///
    /// Any socket that cannot be created or bound aborts startup.
    pub fn init(&mut self) -> Result<(), ServerError> {
        let listens: BTreeSet<Listen> = self
            .configs
            .iter()
            .flat_map(|config| config.listens.iter().cloned())
            .collect();

        for listen in listens {
            let address = SocketAddr::V4(listen.socket_addr()?);
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket
                .bind(&address.into())
                .map_err(|source| ServerError::Bind {
                    listen: listen.clone(),
                    source,
                })?;
            socket.set_nonblocking(true)?;

            let fd = socket.as_raw_fd();
            self.poller.add(fd).map_err(ServerError::Multiplexer)?;
            debug!(fd, listen = %listen, "socket bound");
            self.listeners.insert(fd, (socket, listen));
        }

        self.poller
            .add(self.shutdown.fd())
            .map_err(ServerError::Multiplexer)?;
        Ok(())
    }

    /// Addresses the listening sockets are bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|(socket, _)| socket.local_addr().ok()?.as_socket())
            .collect()
    }

    /// Starts listening and serves connections until shutdown is requested.
    ///
    /// # Errors
    ///
    /// [`ServerError::Listen`] if a bound socket cannot listen, and
    /// [`ServerError::Multiplexer`] if waiting for readiness fails outside
    /// of shutdown.
    pub fn run(&mut self) -> Result<(), ServerError> {
        for (socket, listen) in self.listeners.values() {
            socket
                .listen(LISTEN_BACKLOG)
                .map_err(|source| ServerError::Listen {
                    listen: listen.clone(),
                    source,
                })?;
            info!(listen = %listen, "listening");
        }

        let mut events = Vec::with_capacity(MAX_EVENTS);
        let mut stopping = false;
        while !stopping {
            if let Err(e) = self.poller.wait(&mut events) {
                if self.shutdown.triggered() {
                    break;
                }
                error!(error = %e, "readiness wait failed");
                return Err(ServerError::Multiplexer(e));
            }

            for &event in &events {
                if event.fd == self.shutdown.fd() {
                    stopping |= self.shutdown.triggered();
                    continue;
                }
                self.dispatch(event);
            }
        }

        info!(open_connections = self.clients.len(), "shutting down");
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.teardown(fd);
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        let fd = event.fd;
        if event.error {
            warn!(fd, "socket error");
            self.teardown(fd);
        } else if event.eof {
            debug!(fd, "peer hung up");
            self.teardown(fd);
        } else if self.listeners.contains_key(&fd) {
            self.accept(fd);
        } else if event.readable {
            self.read(fd);
        } else if event.writable {
            self.write(fd);
        } else {
            warn!(fd, ?event, "unexpected readiness event");
            self.teardown(fd);
        }
    }

    fn accept(&mut self, listener: RawFd) {
        let Some((socket, listen)) = self.listeners.get(&listener) else {
            return;
        };
        let listen = listen.clone();

        let (connection, address) = match socket.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(listen = %listen, error = %e, "accept failed");
                return;
            }
        };
        let Some(peer) = address.as_socket() else {
            warn!(listen = %listen, "accepted a non-IP peer");
            return;
        };
        if let Err(e) = connection.set_nonblocking(true) {
            warn!(peer = %peer, error = %e, "cannot make connection non-blocking");
            return;
        }

        let stream = TcpStream::from(connection);
        let fd = stream.as_raw_fd();
        if let Err(e) = self.poller.add(fd) {
            warn!(fd, peer = %peer, error = %e, "cannot register connection");
            return;
        }

        info!(fd, peer = %peer, listen = %listen, "connection accepted");
        self.clients.insert(
            fd,
            Client {
                stream,
                request: Request::new(peer, listen),
                pending: None,
            },
        );
    }

    fn read(&mut self, fd: RawFd) {
        let Some(client) = self.clients.get_mut(&fd) else {
            return;
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        let read = match client.stream.read(&mut buf) {
            Ok(0) => {
                debug!(fd, "connection closed by peer");
                self.teardown(fd);
                return;
            }
            Ok(read) => read,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return;
            }
            Err(e) => {
                warn!(fd, error = %e, "read failed");
                self.teardown(fd);
                return;
            }
        };

        debug!(fd, bytes = read, "read");
        client.request.feed(&buf[..read], &self.configs);
        if client.request.is_complete() {
            if let Err(e) = self.poller.set_write_ready(fd) {
                warn!(fd, error = %e, "cannot rearm for writing");
                self.teardown(fd);
            }
        }
    }

    fn write(&mut self, fd: RawFd) {
        let Some(client) = self.clients.get_mut(&fd) else {
            return;
        };
        if !client.request.is_complete() {
            return;
        }

        let (response, sent) = client
            .pending
            .get_or_insert_with(|| (ResponseEngine::new(&mut client.request).process(), 0));

        match client.stream.write(&response[*sent..]) {
            Ok(0) => {
                warn!(fd, "connection refused further response bytes");
                self.teardown(fd);
            }
            Ok(written) => {
                *sent += written;
                if *sent == response.len() {
                    debug!(fd, bytes = response.len(), "response sent");
                    self.teardown(fd);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!(fd, error = %e, "send failed");
                self.teardown(fd);
            }
        }
    }

    // Deregisters and closes a client connection. Unknown descriptors are
    // ignored, so tearing down twice is harmless.
    fn teardown(&mut self, fd: RawFd) {
        let Some(client) = self.clients.remove(&fd) else {
            return;
        };
        if let Err(e) = self.poller.remove(fd) {
            debug!(fd, error = %e, "deregister failed");
        }
        debug!(fd, peer = %client.request.client(), "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationConfig;

    fn config(listens: &[Listen]) -> ServerConfig {
        let mut config = ServerConfig {
            listens: listens.iter().cloned().collect(),
            ..ServerConfig::default()
        };
        config.add_location(LocationConfig::new("/"));
        config.finalize().unwrap();
        config
    }

    #[test]
    fn empty_configuration_is_rejected() {
        assert!(matches!(Server::new(Vec::new()), Err(ServerError::NoServers)));
    }

    #[test]
    fn shared_listen_is_bound_once() {
        let shared = Listen::new("127.0.0.1", 0);
        let mut server = Server::new(vec![config(&[shared.clone()]), config(&[shared])]).unwrap();
        server.init().unwrap();
        assert_eq!(server.local_addrs().len(), 1);
    }

    #[test]
    fn bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut server = Server::new(vec![config(&[Listen::new("127.0.0.1", port)])]).unwrap();
        assert!(matches!(server.init(), Err(ServerError::Bind { .. })));
    }
}
