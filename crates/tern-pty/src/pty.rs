//! PTY master/slave pair allocation and terminal-attribute control.
//!
//! [`PtyHandle`] owns both descriptors of a pseudo-terminal pair and exposes
//! thin synchronous wrappers over the termios/ioctl surface (window size,
//! echo, flow control, UTF-8 mode, erase character). Allocation goes through
//! the [`PtyProvider`] seam: the native `openpty(3)` allocator first, with a
//! legacy BSD device-name scan as the fallback, so the rest of the engine
//! never cares which strategy produced the pair.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::errno::Errno;
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{
    tcgetattr, tcsetattr, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};

use crate::error::PtyError;

/// Master-side name characters of the legacy BSD `/dev/ptyXY` tables.
const LEGACY_MASTER_CHARS: &[u8] = b"pqrstuvwxyzabcde";
/// Slave-side name characters of the legacy BSD `/dev/ptyXY` tables.
const LEGACY_SLAVE_CHARS: &[u8] = b"0123456789abcdef";

/// A freshly allocated master/slave pair plus the slave device path.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
    pub slave_path: PathBuf,
}

/// Allocation strategy for a PTY pair.
///
/// The engine is written against this trait so a platform port only has to
/// supply another provider; everything above the handle is allocator-agnostic.
pub trait PtyProvider {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Allocate a master/slave pair with close-on-exec set on both ends.
    fn open_pair(&self) -> Result<PtyPair, PtyError>;
}

/// Allocates through the platform's `openpty(3)`.
pub struct NativePtyProvider;

impl PtyProvider for NativePtyProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    fn open_pair(&self) -> Result<PtyPair, PtyError> {
        let pair = openpty(None::<&Winsize>, None::<&Termios>)
            .map_err(|e| PtyError::OpenFailed(format!("openpty failed: {e}")))?;

        set_cloexec(pair.master.as_raw_fd())?;
        set_cloexec(pair.slave.as_raw_fd())?;

        let slave_path = ttyname_of(pair.slave.as_raw_fd()).ok_or_else(|| {
            PtyError::OpenFailed("cannot resolve slave device name".to_string())
        })?;

        Ok(PtyPair {
            master: pair.master,
            slave: pair.slave,
            slave_path,
        })
    }
}

/// Scans the legacy `/dev/pty[p-e][0-9a-f]` master/slave name tables until
/// an unused pair is found. Only reached when the native allocator fails.
pub struct LegacyPtyProvider;

impl PtyProvider for LegacyPtyProvider {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn open_pair(&self) -> Result<PtyPair, PtyError> {
        for &mc in LEGACY_MASTER_CHARS {
            for &sc in LEGACY_SLAVE_CHARS {
                let master_path = format!("/dev/pty{}{}", mc as char, sc as char);
                let slave_path = format!("/dev/tty{}{}", mc as char, sc as char);

                let master = match open_device(&master_path, libc::O_RDWR) {
                    Ok(fd) => fd,
                    Err(_) => continue,
                };

                if !device_accessible(&slave_path) {
                    continue;
                }

                let slave = match open_device(&slave_path, libc::O_RDWR | libc::O_NOCTTY) {
                    Ok(fd) => fd,
                    Err(_) => continue,
                };

                set_cloexec(master.as_raw_fd())?;
                set_cloexec(slave.as_raw_fd())?;

                debug!("legacy pty pair allocated: {slave_path}");
                return Ok(PtyPair {
                    master,
                    slave,
                    slave_path: PathBuf::from(slave_path),
                });
            }
        }

        Err(PtyError::OpenFailed(
            "no legacy pty device available".to_string(),
        ))
    }
}

/// Owns one side of a pseudo-terminal: the master and (until the child takes
/// it) the slave descriptor, plus the slave device path.
///
/// Both descriptors are released exactly once; [`PtyHandle::close`] is
/// idempotent and `Drop` goes through the same path.
pub struct PtyHandle {
    master: Option<OwnedFd>,
    slave: Option<OwnedFd>,
    slave_path: PathBuf,
    owns_master: bool,
}

impl PtyHandle {
    /// Allocate a new pair: native allocator first, legacy scan as fallback.
    pub fn open() -> Result<Self, PtyError> {
        match Self::open_with(&NativePtyProvider) {
            Ok(handle) => Ok(handle),
            Err(native_err) => {
                warn!("native pty allocation failed ({native_err}), trying legacy scan");
                Self::open_with(&LegacyPtyProvider)
            }
        }
    }

    /// Allocate through a specific provider.
    pub fn open_with(provider: &dyn PtyProvider) -> Result<Self, PtyError> {
        let pair = provider.open_pair()?;
        debug!(
            "pty open via {} provider: master fd {}, slave {}",
            provider.name(),
            pair.master.as_raw_fd(),
            pair.slave_path.display()
        );
        Ok(Self {
            master: Some(pair.master),
            slave: Some(pair.slave),
            slave_path: pair.slave_path,
            owns_master: true,
        })
    }

    /// Attach to a master descriptor owned by another component.
    ///
    /// The slave path is resolved by the best available primitive, in order:
    /// the slave-name query, the slave-number ioctl, then the
    /// descriptor-to-path lookup. Fails only if none succeed.
    pub fn open_with_fd(master: OwnedFd) -> Result<Self, PtyError> {
        let raw = master.as_raw_fd();
        let slave_path = ptsname_of(raw)
            .or_else(|| pts_number_of(raw).map(|n| PathBuf::from(format!("/dev/pts/{n}"))))
            .or_else(|| fd_link_path(raw))
            .ok_or_else(|| {
                PtyError::OpenFailed(format!("cannot resolve slave device for fd {raw}"))
            })?;

        if !slave_path.exists() {
            return Err(PtyError::OpenFailed(format!(
                "slave device {} does not exist",
                slave_path.display()
            )));
        }

        let mut handle = Self {
            master: Some(master),
            slave: None,
            slave_path,
            owns_master: false,
        };
        handle.open_slave()?;
        debug!(
            "pty attached to external master fd {raw}, slave {}",
            handle.slave_path.display()
        );
        Ok(handle)
    }

    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }

    /// Whether this handle allocated (and therefore closes) the master.
    pub fn owns_master(&self) -> bool {
        self.owns_master
    }

    pub fn master_fd(&self) -> Option<BorrowedFd<'_>> {
        self.master.as_ref().map(OwnedFd::as_fd)
    }

    pub fn master_raw_fd(&self) -> Option<RawFd> {
        self.master.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn slave_fd(&self) -> Option<BorrowedFd<'_>> {
        self.slave.as_ref().map(OwnedFd::as_fd)
    }

    pub fn slave_raw_fd(&self) -> Option<RawFd> {
        self.slave.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Path of the slave device; empty iff the handle never opened.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Hand the slave descriptor to the caller for the fork boundary.
    ///
    /// This is the one place descriptor ownership legitimately leaves the
    /// handle: the child duplicates it onto stdio and the parent closes its
    /// copy right after the fork.
    pub fn take_slave_for_child(&mut self) -> Option<OwnedFd> {
        self.slave.take()
    }

    /// Close only the slave side, keeping the master open.
    pub fn close_slave(&mut self) {
        if let Some(fd) = self.slave.take() {
            drop(fd);
        }
    }

    /// Reopen the slave device from its path.
    pub fn open_slave(&mut self) -> Result<(), PtyError> {
        if self.slave.is_some() {
            return Ok(());
        }
        if self.master.is_none() {
            return Err(PtyError::OpenFailed(
                "cannot open slave while master is closed".to_string(),
            ));
        }

        let path = self.slave_path.to_string_lossy().into_owned();
        let fd = open_device(&path, libc::O_RDWR | libc::O_NOCTTY)?;
        set_cloexec(fd.as_raw_fd())?;
        self.slave = Some(fd);
        Ok(())
    }

    /// Release the pair. Idempotent.
    ///
    /// In attached mode the master belongs to another component, so instead
    /// of closing it this best-effort restores the slave device permissions
    /// and forgets the descriptor.
    pub fn close(&mut self) {
        if self.master.is_none() {
            return;
        }

        self.close_slave();

        if self.owns_master {
            if let Some(fd) = self.master.take() {
                drop(fd);
            }
        } else {
            self.restore_slave_permissions();
            if let Some(fd) = self.master.take() {
                // The external owner closes this descriptor.
                let _ = fd.into_raw_fd();
            }
        }
    }

    fn restore_slave_permissions(&self) {
        if let Ok(meta) = std::fs::metadata(&self.slave_path) {
            let mut perm = meta.permissions();
            perm.set_mode(0o666);
            if let Err(e) = std::fs::set_permissions(&self.slave_path, perm) {
                debug!(
                    "could not restore permissions on {}: {e}",
                    self.slave_path.display()
                );
            }
        }
    }

    /// Set the logical screen size of the pty.
    pub fn set_win_size(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let fd = self.require_master()?;
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads a winsize struct from a valid pointer.
        let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    /// Current logical screen size as `(rows, cols)`.
    pub fn get_win_size(&self) -> Result<(u16, u16), PtyError> {
        let fd = self.require_master()?;
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ fills a winsize struct behind a valid pointer.
        let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
        if rc < 0 {
            return Err(Errno::last().into());
        }
        Ok((ws.ws_row, ws.ws_col))
    }

    /// `tcgetattr(3)` on the master.
    pub fn tc_get_attr(&self) -> Result<Termios, PtyError> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| PtyError::OpenFailed("pty is closed".to_string()))?;
        Ok(tcgetattr(master.as_fd())?)
    }

    /// `tcsetattr(3)` on the master, applied immediately.
    pub fn tc_set_attr(&self, mode: &Termios) -> Result<(), PtyError> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| PtyError::OpenFailed("pty is closed".to_string()))?;
        tcsetattr(master.as_fd(), SetArg::TCSANOW, mode)?;
        Ok(())
    }

    /// Toggle input echo.
    pub fn set_echo(&self, echo: bool) -> Result<(), PtyError> {
        let mut mode = self.tc_get_attr()?;
        mode.local_flags.set(LocalFlags::ECHO, echo);
        self.tc_set_attr(&mode)
    }

    /// Toggle Xon/Xoff flow control. The terminal application may change
    /// this again later, so a read-back is not guaranteed to match.
    pub fn set_flow_control(&self, enabled: bool) -> Result<(), PtyError> {
        let mut mode = self.tc_get_attr()?;
        mode.input_flags
            .set(InputFlags::IXON | InputFlags::IXOFF, enabled);
        self.tc_set_attr(&mode)
    }

    /// Whether Xon/Xoff flow control is currently active.
    pub fn flow_control(&self) -> Result<bool, PtyError> {
        let mode = self.tc_get_attr()?;
        Ok(mode.input_flags.contains(InputFlags::IXON)
            && mode.input_flags.contains(InputFlags::IXOFF))
    }

    /// Put the pty into UTF-8 mode where the platform supports it.
    #[cfg(target_os = "linux")]
    pub fn set_utf8_mode(&self, enabled: bool) -> Result<(), PtyError> {
        let mut mode = self.tc_get_attr()?;
        mode.input_flags.set(InputFlags::IUTF8, enabled);
        self.tc_set_attr(&mode)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_utf8_mode(&self, _enabled: bool) -> Result<(), PtyError> {
        Ok(())
    }

    /// Set the erase (backspace) control character.
    pub fn set_erase(&self, erase: u8) -> Result<(), PtyError> {
        let mut mode = self.tc_get_attr()?;
        mode.control_chars[SpecialCharacterIndices::VERASE as usize] = erase;
        self.tc_set_attr(&mode)
    }

    /// Current erase control character.
    pub fn erase(&self) -> Result<u8, PtyError> {
        let mode = self.tc_get_attr()?;
        Ok(mode.control_chars[SpecialCharacterIndices::VERASE as usize])
    }

    /// Allow or forbid other users writing to the terminal device.
    pub fn set_writeable(&self, writeable: bool) -> Result<(), PtyError> {
        let meta = std::fs::metadata(&self.slave_path)?;
        let mut perm = meta.permissions();
        let mode = perm.mode();
        let new_mode = if writeable {
            mode | 0o020
        } else {
            mode & !0o022
        };
        perm.set_mode(new_mode);
        std::fs::set_permissions(&self.slave_path, perm)?;
        Ok(())
    }

    /// Become session leader and make this pty the controlling terminal.
    ///
    /// Called in the child between fork and exec; every call in here is a
    /// plain syscall and the error path performs no allocation.
    pub fn set_ctty(&self) -> Result<(), Errno> {
        let slave = match self.slave.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(Errno::EBADF),
        };
        crate::spawn::set_ctty_raw(slave)
    }

    fn require_master(&self) -> Result<RawFd, PtyError> {
        self.master
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| PtyError::OpenFailed("pty is closed".to_string()))
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_cloexec(fd: RawFd) -> Result<(), PtyError> {
    // SAFETY: fcntl with F_SETFD only touches the descriptor flag word.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

fn open_device(path: &str, flags: libc::c_int) -> Result<OwnedFd, PtyError> {
    let c_path = CString::new(path.as_bytes())
        .map_err(|_| PtyError::OpenFailed(format!("path contains nul byte: {path}")))?;
    // SAFETY: c_path is a valid nul-terminated string.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
    if fd < 0 {
        return Err(Errno::last().into());
    }
    // SAFETY: fd was just returned open by the kernel and is owned here.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn device_accessible(path: &str) -> bool {
    let Ok(c_path) = CString::new(path.as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid nul-terminated string.
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

/// `ttyname_r(3)` for a slave descriptor.
fn ttyname_of(fd: RawFd) -> Option<PathBuf> {
    let mut buf = [0u8; 256];
    // SAFETY: buf outlives the call and its length is passed alongside.
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    Some(path_from_cbuf(&buf))
}

/// `ptsname_r(3)` for a master descriptor.
#[cfg(target_os = "linux")]
fn ptsname_of(fd: RawFd) -> Option<PathBuf> {
    let mut buf = [0u8; 256];
    // SAFETY: buf outlives the call and its length is passed alongside.
    let rc = unsafe { libc::ptsname_r(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    Some(path_from_cbuf(&buf))
}

#[cfg(not(target_os = "linux"))]
fn ptsname_of(_fd: RawFd) -> Option<PathBuf> {
    None
}

/// `TIOCGPTN` slave-number query for a master descriptor.
#[cfg(target_os = "linux")]
fn pts_number_of(fd: RawFd) -> Option<u32> {
    let mut n: libc::c_uint = 0;
    // SAFETY: TIOCGPTN writes a c_uint through a valid pointer.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGPTN, &mut n) };
    if rc < 0 {
        return None;
    }
    Some(n)
}

#[cfg(not(target_os = "linux"))]
fn pts_number_of(_fd: RawFd) -> Option<u32> {
    None
}

/// Resolve the device behind a descriptor through `/proc/self/fd`.
fn fd_link_path(fd: RawFd) -> Option<PathBuf> {
    let link = std::fs::read_link(format!("/proc/self/fd/{fd}")).ok()?;
    if link.as_os_str().as_bytes().starts_with(b"/dev/") {
        Some(link)
    } else {
        None
    }
}

fn path_from_cbuf(buf: &[u8]) -> PathBuf {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    PathBuf::from(String::from_utf8_lossy(&buf[..len]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_native() {
        let handle = PtyHandle::open().expect("failed to open pty");
        assert!(handle.is_open());
        assert!(handle.owns_master());
        assert!(handle.master_raw_fd().is_some());
        assert!(handle.slave_raw_fd().is_some());
        assert!(
            handle.slave_path().starts_with("/dev/"),
            "unexpected slave path: {}",
            handle.slave_path().display()
        );
    }

    #[test]
    fn test_independent_handles() {
        // Two concurrently open handles get distinct slave devices, and
        // closing the first leaves the second untouched.
        let mut first = PtyHandle::open().expect("first pty");
        let second = PtyHandle::open().expect("second pty");

        assert_ne!(first.slave_path(), second.slave_path());

        let second_master = second.master_raw_fd().expect("second master fd");
        first.close();
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(second.master_raw_fd(), Some(second_master));

        // The surviving master still accepts ioctls.
        second.set_win_size(24, 80).expect("resize after peer close");
    }

    #[test]
    fn test_close_idempotent() {
        let mut handle = PtyHandle::open().expect("failed to open pty");
        handle.close();
        assert!(!handle.is_open());
        // A second close on an already-closed handle is a no-op.
        handle.close();
        assert!(!handle.is_open());
    }

    #[test]
    fn test_win_size_roundtrip() {
        let handle = PtyHandle::open().expect("failed to open pty");
        handle.set_win_size(42, 132).expect("set_win_size");
        assert_eq!(handle.get_win_size().expect("get_win_size"), (42, 132));
    }

    #[test]
    fn test_echo_toggle() {
        let handle = PtyHandle::open().expect("failed to open pty");

        handle.set_echo(false).expect("disable echo");
        let mode = handle.tc_get_attr().expect("tcgetattr");
        assert!(!mode.local_flags.contains(LocalFlags::ECHO));

        handle.set_echo(true).expect("enable echo");
        let mode = handle.tc_get_attr().expect("tcgetattr");
        assert!(mode.local_flags.contains(LocalFlags::ECHO));
    }

    #[test]
    fn test_flow_control_toggle() {
        let handle = PtyHandle::open().expect("failed to open pty");

        handle.set_flow_control(false).expect("disable flow control");
        assert!(!handle.flow_control().expect("flow_control"));

        handle.set_flow_control(true).expect("enable flow control");
        assert!(handle.flow_control().expect("flow_control"));
    }

    #[test]
    fn test_erase_char() {
        let handle = PtyHandle::open().expect("failed to open pty");
        handle.set_erase(0x08).expect("set_erase");
        assert_eq!(handle.erase().expect("erase"), 0x08);
    }

    #[test]
    fn test_open_with_fd_resolves_same_slave() {
        let donor = PtyHandle::open().expect("donor pty");
        let donor_path = donor.slave_path().to_path_buf();
        let master = donor.master_raw_fd().expect("donor master");

        // Attach through a duplicate of the donor's master descriptor.
        // SAFETY: master is a valid open fd; dup returns a new descriptor
        // owned below.
        let dup = unsafe { libc::dup(master) };
        assert!(dup >= 0, "dup failed");
        let dup = unsafe { OwnedFd::from_raw_fd(dup) };

        let mut attached = PtyHandle::open_with_fd(dup).expect("attach to master fd");
        assert!(!attached.owns_master());
        assert_eq!(attached.slave_path(), donor_path);

        // Closing the attached handle must not close the donor's pair.
        attached.close();
        donor.set_win_size(24, 80).expect("donor still usable");
    }

    #[test]
    fn test_close_slave_and_reopen() {
        let mut handle = PtyHandle::open().expect("failed to open pty");
        handle.close_slave();
        assert!(handle.slave_raw_fd().is_none());

        handle.open_slave().expect("reopen slave");
        assert!(handle.slave_raw_fd().is_some());
    }

    #[test]
    fn test_take_slave_for_child() {
        let mut handle = PtyHandle::open().expect("failed to open pty");
        let slave = handle.take_slave_for_child();
        assert!(slave.is_some());
        assert!(handle.slave_raw_fd().is_none());
        // The handle no longer owns the slave; a second take yields nothing.
        assert!(handle.take_slave_for_child().is_none());
    }

    #[test]
    fn test_legacy_provider_does_not_panic() {
        // Modern systems rarely carry the BSD name tables; the scan must
        // fail cleanly rather than crash when they are absent.
        match LegacyPtyProvider.open_pair() {
            Ok(pair) => assert!(pair.slave_path.starts_with("/dev/")),
            Err(PtyError::OpenFailed(_)) => {}
            Err(other) => panic!("unexpected error class: {other}"),
        }
    }
}
