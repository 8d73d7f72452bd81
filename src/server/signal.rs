//! Shutdown as a readiness event.
//!
//! [`Shutdown`] owns a socket pair. Its read end is registered with the
//! multiplexer like any client, and a byte written to the other end (from a
//! signal handler or a [`ShutdownHandle`]) wakes the event loop and stops it.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use signal_hook::SigId;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::low_level::{self, pipe};
use tracing::debug;

/// Signals that stop the server gracefully.
pub const SHUTDOWN_SIGNALS: [libc::c_int; 3] = [SIGINT, SIGQUIT, SIGTERM];

pub struct Shutdown {
    reader: UnixStream,
    writer: Arc<UnixStream>,
    signals: Vec<SigId>,
}

impl Shutdown {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            reader,
            writer: Arc::new(writer),
            signals: Vec::new(),
        })
    }

    /// Routes SIGINT, SIGQUIT and SIGTERM into the shutdown pipe.
    pub fn install_signal_handlers(&mut self) -> io::Result<()> {
        for signal in SHUTDOWN_SIGNALS {
            let writer = self.writer.try_clone()?;
            self.signals.push(pipe::register(signal, writer)?);
            debug!(signal, "shutdown signal handler installed");
        }
        Ok(())
    }

    /// A handle that triggers the same shutdown path as a signal.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            writer: Arc::clone(&self.writer),
        }
    }

    /// The descriptor to register for read readiness.
    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Drains the pipe, returning `true` if shutdown was requested.
    pub fn triggered(&self) -> bool {
        let mut buf = [0u8; 16];
        let mut seen = false;
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return seen,
                Ok(_) => seen = true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return seen,
            }
        }
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        for id in self.signals.drain(..) {
            low_level::unregister(id);
        }
    }
}

/// Stops a running [`Server`](super::Server) from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    writer: Arc<UnixStream>,
}

impl ShutdownHandle {
    pub fn trigger(&self) -> io::Result<()> {
        match (&*self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            // a full pipe already holds a pending request
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("fd", &self.writer.as_raw_fd())
            .finish()
    }
}
