//! Non-blocking, readiness-driven I/O over a PTY master descriptor.
//!
//! [`AsyncPtyChannel`] pairs a [`PtyHandle`] with one [`RingBuffer`] for
//! reads and one for writes. The reactor calls [`handle_readable`] and
//! [`handle_writable`] when `poll(2)` reports readiness; outside the reactor,
//! the bounded [`wait_for_readable`]/[`wait_for_writable`] fallbacks drive
//! the same paths synchronously.
//!
//! Each readable dispatch probes the kernel queue with `FIONREAD` and
//! reserves exactly that many bytes, so a burst never over-allocates and a
//! zero-byte queue on a readable descriptor is the EOF signal from the
//! child's side closing.
//!
//! [`handle_readable`]: AsyncPtyChannel::handle_readable
//! [`handle_writable`]: AsyncPtyChannel::handle_writable
//! [`wait_for_readable`]: AsyncPtyChannel::wait_for_readable
//! [`wait_for_writable`]: AsyncPtyChannel::wait_for_writable

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;

use crate::error::PtyError;
use crate::pty::PtyHandle;
use crate::ring::RingBuffer;

/// What one readable dispatch produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadEvent {
    /// Bytes moved from the kernel into the read buffer.
    pub bytes_read: usize,
    /// The peer closed its end; reported exactly once.
    pub eof: bool,
}

/// Buffered, readiness-driven channel over a PTY master.
pub struct AsyncPtyChannel {
    pty: PtyHandle,
    read_buffer: RingBuffer,
    write_buffer: RingBuffer,
    suspended: bool,
    eof_seen: bool,
    eof_reported: bool,
    broken: bool,
}

impl AsyncPtyChannel {
    pub fn new(pty: PtyHandle) -> Self {
        Self {
            pty,
            read_buffer: RingBuffer::new(),
            write_buffer: RingBuffer::new(),
            suspended: false,
            eof_seen: false,
            eof_reported: false,
            broken: false,
        }
    }

    pub fn pty(&self) -> &PtyHandle {
        &self.pty
    }

    pub fn pty_mut(&mut self) -> &mut PtyHandle {
        &mut self.pty
    }

    pub fn is_open(&self) -> bool {
        self.pty.is_open()
    }

    /// Close the underlying pair. Buffered data is discarded.
    pub fn close(&mut self) {
        self.pty.close();
        self.read_buffer.clear();
        self.write_buffer.clear();
    }

    /// Stop asking the reactor for read readiness without closing the
    /// channel. Already-buffered data stays readable.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Whether the peer's end was seen closed.
    pub fn eof_seen(&self) -> bool {
        self.eof_seen
    }

    /// Whether a hard I/O error disabled the channel.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Whether the reactor should watch this channel for read readiness.
    pub fn wants_read(&self) -> bool {
        self.is_open() && !self.suspended && !self.eof_seen && !self.broken
    }

    /// Whether the reactor should watch this channel for write readiness.
    pub fn wants_write(&self) -> bool {
        self.is_open() && !self.broken && !self.write_buffer.is_empty()
    }

    /// Bytes buffered and ready for [`AsyncPtyChannel::read`].
    pub fn bytes_available(&self) -> usize {
        self.read_buffer.len()
    }

    /// Bytes queued but not yet accepted by the kernel.
    pub fn bytes_to_write(&self) -> usize {
        self.write_buffer.len()
    }

    pub fn can_read_line(&self) -> bool {
        self.read_buffer.can_read_line()
    }

    /// Consume up to `dst.len()` buffered bytes.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        self.read_buffer.read(dst)
    }

    /// Consume one buffered line, newline inclusive.
    pub fn read_line(&mut self, dst: &mut [u8]) -> usize {
        self.read_buffer.read_line(dst)
    }

    /// Queue bytes for delivery to the child and arm write readiness.
    pub fn send(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.write_buffer.write(bytes);
    }

    /// Service read readiness: probe the kernel queue, read exactly that
    /// many bytes into the read buffer, and report one event.
    ///
    /// `EAGAIN` produces an empty event; a zero-byte queue or `EIO` reports
    /// EOF exactly once; any other failure disables the channel and is
    /// surfaced exactly once so the reactor never busy-spins on a dead
    /// descriptor.
    pub fn handle_readable(&mut self) -> Result<ReadEvent, PtyError> {
        if self.broken || !self.is_open() {
            return Ok(ReadEvent::default());
        }
        let fd = match self.pty.master_raw_fd() {
            Some(fd) => fd,
            None => return Ok(ReadEvent::default()),
        };

        let available = match kernel_bytes_available(fd) {
            Ok(n) => n,
            Err(Errno::EBADF) => {
                self.broken = true;
                return Err(PtyError::from(Errno::EBADF));
            }
            Err(Errno::EIO) => return Ok(self.mark_eof()),
            Err(e) => {
                warn!("pty availability probe failed: {e}");
                self.broken = true;
                return Err(e.into());
            }
        };

        if available == 0 {
            return Ok(self.mark_eof());
        }

        let view = self.read_buffer.reserve(available);
        match read_no_intr(fd, view) {
            Ok(0) => {
                self.read_buffer.unreserve(available);
                Ok(self.mark_eof())
            }
            Ok(n) => {
                if n < available {
                    self.read_buffer.unreserve(available - n);
                }
                Ok(ReadEvent {
                    bytes_read: n,
                    eof: false,
                })
            }
            Err(Errno::EAGAIN) => {
                self.read_buffer.unreserve(available);
                Ok(ReadEvent::default())
            }
            Err(Errno::EIO) => {
                // The slave side is fully closed; on Linux a dead child
                // surfaces as EIO rather than a zero-byte read.
                self.read_buffer.unreserve(available);
                Ok(self.mark_eof())
            }
            Err(e) => {
                self.read_buffer.unreserve(available);
                self.broken = true;
                warn!("pty read failed on fd {fd}: {e}");
                Err(e.into())
            }
        }
    }

    fn mark_eof(&mut self) -> ReadEvent {
        self.eof_seen = true;
        if self.eof_reported {
            return ReadEvent::default();
        }
        self.eof_reported = true;
        debug!("pty read EOF on fd {:?}", self.pty.master_raw_fd());
        ReadEvent {
            bytes_read: 0,
            eof: true,
        }
    }

    /// Service write readiness: flush as much of the write buffer as the
    /// kernel accepts in one call. A partial write is not an error; write
    /// readiness stays armed while the buffer is non-empty.
    pub fn handle_writable(&mut self) -> Result<usize, PtyError> {
        if self.broken || self.write_buffer.is_empty() {
            return Ok(0);
        }
        let fd = match self.pty.master_raw_fd() {
            Some(fd) => fd,
            None => return Ok(0),
        };

        let result = {
            let chunk = self.write_buffer.read_pointer();
            write_no_intr(fd, chunk)
        };

        match result {
            Ok(n) => {
                self.write_buffer.free(n);
                Ok(n)
            }
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => {
                self.broken = true;
                warn!("pty write failed on fd {fd}: {e}");
                Err(e.into())
            }
        }
    }

    /// Block until data arrives (true) or the peer closes (false), at most
    /// `timeout`.
    ///
    /// This is the synchronous fallback for callers outside the reactor
    /// loop. Calling it from inside a reactor callback would deadlock the
    /// loop and is forbidden.
    pub fn wait_for_readable(&mut self, timeout: Duration) -> Result<bool, PtyError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.eof_seen {
                return Ok(false);
            }
            let fd = self
                .pty
                .master_raw_fd()
                .ok_or_else(|| PtyError::OpenFailed("pty is closed".to_string()))?;

            let remaining = remaining_ms(deadline)?;
            let revents = poll_fd(fd, libc::POLLIN, remaining)?;
            if revents == 0 {
                return Err(PtyError::Timeout);
            }

            let event = self.handle_readable()?;
            if event.bytes_read > 0 {
                return Ok(true);
            }
            if event.eof {
                return Ok(false);
            }
        }
    }

    /// Block until the write buffer is fully flushed, at most `timeout`.
    ///
    /// Same hazard as [`AsyncPtyChannel::wait_for_readable`]: never call
    /// from inside a reactor callback.
    pub fn wait_for_writable(&mut self, timeout: Duration) -> Result<(), PtyError> {
        let deadline = Instant::now() + timeout;

        while !self.write_buffer.is_empty() {
            let fd = self
                .pty
                .master_raw_fd()
                .ok_or_else(|| PtyError::OpenFailed("pty is closed".to_string()))?;

            let remaining = remaining_ms(deadline)?;
            let revents = poll_fd(fd, libc::POLLOUT, remaining)?;
            if revents == 0 {
                return Err(PtyError::Timeout);
            }

            self.handle_writable()?;
        }
        Ok(())
    }
}

fn remaining_ms(deadline: Instant) -> Result<i32, PtyError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(PtyError::Timeout);
    }
    Ok((deadline - now).as_millis().min(i32::MAX as u128) as i32)
}

/// `read(2)` with EINTR retry.
pub(crate) fn read_no_intr(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    loop {
        // SAFETY: buf is valid for writes of buf.len() bytes for the call.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = Errno::last();
        if errno != Errno::EINTR {
            return Err(errno);
        }
    }
}

/// `write(2)` with EINTR retry.
pub(crate) fn write_no_intr(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    loop {
        // SAFETY: buf is valid for reads of buf.len() bytes for the call.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = Errno::last();
        if errno != Errno::EINTR {
            return Err(errno);
        }
    }
}

/// Bytes immediately readable on `fd` per the kernel's input queue.
pub(crate) fn kernel_bytes_available(fd: RawFd) -> Result<usize, Errno> {
    let mut n: libc::c_int = 0;
    // SAFETY: FIONREAD writes a c_int through a valid pointer.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) };
    if rc < 0 {
        return Err(Errno::last());
    }
    Ok(n.max(0) as usize)
}

/// Poll a single descriptor; returns the revents word, 0 on timeout.
pub(crate) fn poll_fd(fd: RawFd, events: i16, timeout_ms: i32) -> Result<i16, PtyError> {
    let mut fds = [libc::pollfd {
        fd,
        events,
        revents: 0,
    }];
    loop {
        // SAFETY: fds points at one initialized pollfd for the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if rc >= 0 {
            return Ok(fds[0].revents);
        }
        let errno = Errno::last();
        if errno != Errno::EINTR {
            return Err(errno.into());
        }
    }
}
