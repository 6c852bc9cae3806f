//! Event fd and poll plumbing for the frontend loop.

use std::io;
use std::os::unix::io::RawFd;

/// Non-blocking event fd; the backend pokes it, the frontend polls and
/// drains it.
pub struct EventFd {
    fd: RawFd,
}

unsafe impl Send for EventFd {}
unsafe impl Sync for EventFd {}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventFd { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) {
        let one: u64 = 1;
        let ret = unsafe { libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8) };
        // EAGAIN just means the counter is already saturated; the wakeup
        // is pending either way.
        debug_assert!(ret == 8 || io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock);
    }

    /// Consume pending events; returns whether there were any.
    pub fn drain(&self) -> bool {
        let mut count: u64 = 0;
        let ret = unsafe { libc::read(self.fd, &mut count as *mut u64 as *mut libc::c_void, 8) };
        ret == 8
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// `poll(2)` over raw fds; returns the number of ready entries.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}
