use nix::errno::Errno;

/// Errors from the PTY session engine.
#[derive(Debug)]
pub enum PtyError {
    /// No PTY device could be allocated, or permissions were denied.
    OpenFailed(String),
    /// Fork or exec failed before the child produced any output.
    SpawnFailed(String),
    /// A non-EAGAIN read/write failure on an open channel.
    IoError(std::io::Error),
    /// A bounded wait exceeded its deadline.
    Timeout,
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::OpenFailed(msg) => write!(f, "PTY open failed: {msg}"),
            PtyError::SpawnFailed(msg) => write!(f, "PTY spawn failed: {msg}"),
            PtyError::IoError(err) => write!(f, "PTY I/O error: {err}"),
            PtyError::Timeout => write!(f, "PTY operation timed out"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::IoError(err)
    }
}

impl From<Errno> for PtyError {
    fn from(errno: Errno) -> Self {
        PtyError::IoError(std::io::Error::from_raw_os_error(errno as i32))
    }
}
