//! Readiness multiplexer over `epoll` (Linux, Android) or `kqueue` (macOS,
//! iOS, FreeBSD, DragonFly).
//!
//! Both back ends implement [`Multiplexer`]; [`Poller`] names the one chosen
//! for the build target. Descriptors start out read-registered. Moving a
//! connection into its response phase with
//! [`set_write_ready`](Multiplexer::set_write_ready) replaces read interest
//! with write interest.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Most events returned by a single [`Multiplexer::wait`].
pub const MAX_EVENTS: usize = 100;

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub error: bool,
    /// The peer closed the connection.
    pub eof: bool,
    pub readable: bool,
    pub writable: bool,
}

/// A batch readiness facility.
pub trait Multiplexer {
    /// Registers `fd` for read readiness.
    fn add(&mut self, fd: RawFd) -> io::Result<()>;

    /// Switches `fd` from read to write readiness.
    fn set_write_ready(&mut self, fd: RawFd) -> io::Result<()>;

    /// Deregisters `fd`. Removing an unknown descriptor is not an error.
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks until at least one registered descriptor is ready and replaces
    /// the contents of `events` with up to [`MAX_EVENTS`] notifications.
    ///
    /// An interrupted wait returns `Ok` with no events.
    fn wait(&mut self, events: &mut Vec<Event>) -> io::Result<()>;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub type Poller = Epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub type Poller = Kqueue;

fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
        other => other,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::epoll::Epoll;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll {
    use super::*;

    pub struct Epoll {
        fd: OwnedFd,
        buffer: Vec<libc::epoll_event>,
    }

    impl Epoll {
        pub fn new() -> io::Result<Self> {
            // SAFETY: plain syscall, the result is checked by `cvt`.
            let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
            Ok(Self {
                // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
                buffer: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
            })
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, interest: libc::c_int) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: interest as u32,
                u64: fd as u64,
            };
            // SAFETY: `event` outlives the call.
            cvt(unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) })?;
            Ok(())
        }
    }

    impl Multiplexer for Epoll {
        fn add(&mut self, fd: RawFd) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN)
        }

        fn set_write_ready(&mut self, fd: RawFd) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, libc::EPOLLOUT)
        }

        fn remove(&mut self, fd: RawFd) -> io::Result<()> {
            ignore_not_found(self.ctl(libc::EPOLL_CTL_DEL, fd, 0))
        }

        fn wait(&mut self, events: &mut Vec<Event>) -> io::Result<()> {
            events.clear();
            // SAFETY: the buffer holds `MAX_EVENTS` initialized entries.
            let ready = unsafe {
                libc::epoll_wait(
                    self.fd.as_raw_fd(),
                    self.buffer.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    -1,
                )
            };
            let ready = match cvt(ready) {
                Ok(ready) => ready as usize,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(e) => return Err(e),
            };

            for raw in &self.buffer[..ready] {
                // copy out of the (possibly packed) struct before testing bits
                let flags = raw.events as libc::c_int;
                let token = raw.u64;
                events.push(Event {
                    fd: token as RawFd,
                    error: flags & libc::EPOLLERR != 0,
                    eof: flags & libc::EPOLLHUP != 0,
                    readable: flags & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
                    writable: flags & libc::EPOLLOUT != 0,
                });
            }
            Ok(())
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub use self::kqueue::Kqueue;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
mod kqueue {
    use std::{mem, ptr};

    use super::*;

    pub struct Kqueue {
        fd: OwnedFd,
        buffer: Vec<libc::kevent>,
    }

    fn kevent(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
        // SAFETY: `kevent` is plain old data; all-zero is a valid value.
        let mut event: libc::kevent = unsafe { mem::zeroed() };
        event.ident = fd as libc::uintptr_t;
        event.filter = filter;
        event.flags = flags;
        event
    }

    impl Kqueue {
        pub fn new() -> io::Result<Self> {
            // SAFETY: plain syscall, the result is checked by `cvt`.
            let fd = cvt(unsafe { libc::kqueue() })?;
            // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            // SAFETY: as above, all-zero `kevent`s are valid.
            let buffer = vec![unsafe { mem::zeroed() }; MAX_EVENTS];
            Ok(Self { fd, buffer })
        }

        fn change(&self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
            let event = kevent(fd, filter, flags);
            // SAFETY: one change, no event list, `event` outlives the call.
            cvt(unsafe {
                libc::kevent(
                    self.fd.as_raw_fd(),
                    &event,
                    1,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                )
            })?;
            Ok(())
        }
    }

    impl Multiplexer for Kqueue {
        fn add(&mut self, fd: RawFd) -> io::Result<()> {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE)
        }

        fn set_write_ready(&mut self, fd: RawFd) -> io::Result<()> {
            ignore_not_found(self.change(fd, libc::EVFILT_READ, libc::EV_DELETE))?;
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE)
        }

        fn remove(&mut self, fd: RawFd) -> io::Result<()> {
            ignore_not_found(self.change(fd, libc::EVFILT_READ, libc::EV_DELETE))?;
            ignore_not_found(self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE))
        }

        fn wait(&mut self, events: &mut Vec<Event>) -> io::Result<()> {
            events.clear();
            // SAFETY: the buffer holds `MAX_EVENTS` initialized entries.
            let ready = unsafe {
                libc::kevent(
                    self.fd.as_raw_fd(),
                    ptr::null(),
                    0,
                    self.buffer.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    ptr::null(),
                )
            };
            let ready = match cvt(ready) {
                Ok(ready) => ready as usize,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(e) => return Err(e),
            };

            for raw in &self.buffer[..ready] {
                events.push(Event {
                    fd: raw.ident as RawFd,
                    error: raw.flags & libc::EV_ERROR != 0,
                    eof: raw.flags & libc::EV_EOF != 0,
                    readable: raw.filter == libc::EVFILT_READ,
                    writable: raw.filter == libc::EVFILT_WRITE,
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn reports_read_then_write_readiness() {
        let mut poller = Poller::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();
        poller.add(fd).unwrap();

        writer.write_all(b"ping").unwrap();
        let mut events = Vec::new();
        poller.wait(&mut events).unwrap();
        let event = events.iter().find(|e| e.fd == fd).unwrap();
        assert!(event.readable);
        assert!(!event.error);

        poller.set_write_ready(fd).unwrap();
        poller.wait(&mut events).unwrap();
        let event = events.iter().find(|e| e.fd == fd).unwrap();
        assert!(event.writable);
        assert!(!event.readable);
    }

    #[test]
    fn peer_close_is_reported() {
        let mut poller = Poller::new().unwrap();
        let (writer, reader) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();
        poller.add(fd).unwrap();
        drop(writer);

        let mut events = Vec::new();
        poller.wait(&mut events).unwrap();
        let event = events.iter().find(|e| e.fd == fd).unwrap();
        assert!(event.eof || event.readable);
    }

    #[test]
    fn removing_twice_is_harmless() {
        let mut poller = Poller::new().unwrap();
        let (_writer, reader) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();
        poller.add(fd).unwrap();
        poller.remove(fd).unwrap();
        poller.remove(fd).unwrap();
    }
}
