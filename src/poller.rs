//! Thin epoll wrapper used by the completion dispatcher.
//!
//! Sockets are registered disarmed and re-armed per posted operation with
//! `EPOLLONESHOT`, so one readiness event corresponds to one serviced
//! operation. A pipe doubles as the wake-up notifier for shutting the
//! poll loop down.

use std::{
  io,
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
  ptr,
};

macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

/// Key reserved for the internal wake-up pipe.
pub(crate) const NOTIFY_KEY: u64 = u64::MAX;

/// One decoded readiness event.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
  pub key: u64,
  pub readable: bool,
  pub writable: bool,
}

pub(crate) struct Poller {
  epoll: OwnedFd,
  notify_read: OwnedFd,
  notify_write: OwnedFd,
}

impl Poller {
  pub fn new() -> io::Result<Self> {
    let epoll = unsafe {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      OwnedFd::from_raw_fd(fd)
    };

    let mut fds = [0i32; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
    // SAFETY: pipe2 just produced both fds; nothing else owns them.
    let (notify_read, notify_write) =
      unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    // The notifier stays level-triggered and permanently armed.
    let mut event =
      libc::epoll_event { events: libc::EPOLLIN as u32, u64: NOTIFY_KEY };
    syscall!(epoll_ctl(
      epoll.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      notify_read.as_raw_fd(),
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(Self { epoll, notify_read, notify_write })
  }

  /// Registers a socket disarmed; [`arm`](Self::arm) enables interest.
  pub fn add(&self, fd: RawFd, key: u64) -> io::Result<()> {
    let mut event =
      libc::epoll_event { events: libc::EPOLLONESHOT as u32, u64: key };
    syscall!(epoll_ctl(
      self.epoll.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }

  /// Re-arms one-shot interest for the given directions.
  pub fn arm(&self, fd: RawFd, key: u64, readable: bool, writable: bool) -> io::Result<()> {
    let mut events = libc::EPOLLONESHOT as u32;
    if readable {
      events |= libc::EPOLLIN as u32;
    }
    if writable {
      events |= libc::EPOLLOUT as u32;
    }
    let mut event = libc::epoll_event { events, u64: key };
    syscall!(epoll_ctl(
      self.epoll.as_raw_fd(),
      libc::EPOLL_CTL_MOD,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }

  pub fn delete(&self, fd: RawFd) -> io::Result<()> {
    syscall!(epoll_ctl(
      self.epoll.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    ))?;
    Ok(())
  }

  /// Blocks until at least one event arrives, filling `buf`.
  pub fn wait(&self, buf: &mut [libc::epoll_event]) -> io::Result<usize> {
    let n = syscall!(epoll_wait(
      self.epoll.as_raw_fd(),
      buf.as_mut_ptr(),
      buf.len() as i32,
      -1,
    ))?;
    Ok(n as usize)
  }

  pub fn decode(event: &libc::epoll_event) -> Event {
    // EPOLLERR/EPOLLHUP surface as readiness so the pending syscall runs
    // and reports the real error.
    let readable = event.events
      & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32
      != 0;
    let writable =
      event.events & (libc::EPOLLOUT | libc::EPOLLERR) as u32 != 0;
    Event { key: event.u64, readable, writable }
  }

  /// Wakes a blocked [`wait`](Self::wait) call.
  pub fn notify(&self) -> io::Result<()> {
    let byte: u8 = 1;
    let result = syscall!(write(
      self.notify_write.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    ));
    match result {
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  /// Drains the wake-up pipe after a notify event was observed.
  pub fn drain_notify(&self) {
    let mut sink = [0u8; 64];
    loop {
      let res = syscall!(read(
        self.notify_read.as_raw_fd(),
        sink.as_mut_ptr() as *mut libc::c_void,
        sink.len(),
      ));
      match res {
        Ok(n) if n > 0 => continue,
        _ => break,
      }
    }
  }
}
